//! Keyed query cache with invalidation and fetch de-duplication.
//!
//! [`QueryCache`] stores the last known result per key and refetches on
//! demand. The rules:
//!
//! - At most one fetch per key is in flight. Invalidating a key while its
//!   fetch is running queues exactly one follow-up fetch; further
//!   invalidations before that follow-up starts are absorbed.
//! - Only keys with at least one enabled subscriber are fetched. Other
//!   keys are just marked stale and refetched when someone subscribes.
//! - Every fetch gets a generation number. A result is applied only if
//!   its generation is still current, so `fetched_at` never moves
//!   backwards for a key.
//! - A failed fetch keeps the previous value and records the error
//!   (stale-while-revalidate).
//! - When the last enabled subscriber leaves while a fetch is running,
//!   that fetch is orphaned: it still resolves, but writes nothing. A
//!   direct [`QueryCache::set_data`] retires a running fetch the same way.
//!
//! No lock is ever held across an `.await` or while calling a fetcher,
//! so fetchers and subscribers may call back into the cache.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use newsdesk_core::types::Timestamp;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

/// Produces the value for a key.
pub type Fetcher<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<V, FetchError>> + Send + Sync>;

/// Wrap an async closure as a [`Fetcher`].
pub fn fetcher<K, V, F, Fut>(f: F) -> Fetcher<K, V>
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
{
    Arc::new(move |key| f(key).boxed())
}

/// Per-subscription options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// While `false` the subscription never causes a fetch.
    pub enabled: bool,
    /// Invalidate the key on this period while subscribed.
    pub refetch_interval: Option<Duration>,
    /// A value younger than this is served without refetching when the
    /// subscription is created.
    pub stale_time: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            refetch_interval: None,
            stale_time: Duration::ZERO,
        }
    }
}

/// What a subscriber sees for one key.
#[derive(Debug, Clone)]
pub struct QuerySnapshot<V> {
    /// Last successfully fetched value, kept across failed refetches.
    pub data: Option<V>,
    /// A fetch for this key is in flight.
    pub is_loading: bool,
    /// Error of the most recent fetch, cleared by the next success.
    pub error: Option<FetchError>,
    pub fetched_at: Option<Timestamp>,
}

impl<V> QuerySnapshot<V> {
    fn empty() -> Self {
        Self {
            data: None,
            is_loading: false,
            error: None,
            fetched_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct SubscriberState {
    enabled: bool,
    timer: Option<CancellationToken>,
}

struct Entry<K, V> {
    value: Option<V>,
    fetched_at: Option<Timestamp>,
    fetched_instant: Option<Instant>,
    error: Option<FetchError>,
    stale: bool,
    /// Generation of the most recently issued (or orphaned) fetch.
    generation: u64,
    in_flight: bool,
    queued: bool,
    fetch_count: u64,
    fetcher: Option<Fetcher<K, V>>,
    subscribers: HashMap<u64, SubscriberState>,
    tx: watch::Sender<QuerySnapshot<V>>,
}

impl<K, V: Clone> Entry<K, V> {
    fn new() -> Self {
        let (tx, _) = watch::channel(QuerySnapshot::empty());
        Self {
            value: None,
            fetched_at: None,
            fetched_instant: None,
            error: None,
            stale: true,
            generation: 0,
            in_flight: false,
            queued: false,
            fetch_count: 0,
            fetcher: None,
            subscribers: HashMap::new(),
            tx,
        }
    }

    fn enabled_subscribers(&self) -> usize {
        self.subscribers.values().filter(|s| s.enabled).count()
    }

    fn needs_fetch(&self, stale_time: Duration) -> bool {
        match (&self.value, self.fetched_instant) {
            (Some(_), Some(at)) => self.stale || at.elapsed() >= stale_time,
            _ => true,
        }
    }

    fn publish(&self) {
        self.tx.send_replace(QuerySnapshot {
            data: self.value.clone(),
            is_loading: self.in_flight,
            error: self.error.clone(),
            fetched_at: self.fetched_at,
        });
    }

    /// Drop interest in the running fetch. Its result will be discarded.
    fn orphan_in_flight(&mut self) {
        if self.in_flight {
            self.generation += 1;
            self.in_flight = false;
            self.queued = false;
            self.publish();
        }
    }
}

/// A fetch that has been registered but not yet started.
struct FetchJob<K, V> {
    key: K,
    generation: u64,
    fetcher: Fetcher<K, V>,
}

struct CacheState<K, V> {
    entries: HashMap<K, Entry<K, V>>,
    next_subscriber: u64,
}

struct CacheInner<K, V> {
    name: &'static str,
    state: Mutex<CacheState<K, V>>,
}

// ---------------------------------------------------------------------------
// QueryCache
// ---------------------------------------------------------------------------

/// Shared handle to a keyed query cache. Cloning is cheap.
pub struct QueryCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for QueryCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> QueryCache<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// `name` only labels log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                name,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    next_subscriber: 0,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState<K, V>> {
        // Nothing user-supplied runs under this lock.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Last known value for `key`. Never fetches.
    pub fn get(&self, key: &K) -> Option<V> {
        self.state()
            .entries
            .get(key)
            .and_then(|entry| entry.value.clone())
    }

    /// Current snapshot for `key` (empty if the key was never seen).
    pub fn snapshot(&self, key: &K) -> QuerySnapshot<V> {
        self.state()
            .entries
            .get(key)
            .map(|entry| entry.tx.borrow().clone())
            .unwrap_or_else(QuerySnapshot::empty)
    }

    /// Every key currently holding a value or subscribers.
    pub fn keys(&self) -> Vec<K> {
        self.state().entries.keys().cloned().collect()
    }

    pub fn subscriber_count(&self, key: &K) -> usize {
        self.state()
            .entries
            .get(key)
            .map_or(0, |entry| entry.subscribers.len())
    }

    pub fn is_fetching(&self, key: &K) -> bool {
        self.state()
            .entries
            .get(key)
            .is_some_and(|entry| entry.in_flight)
    }

    /// Number of fetches ever started for `key`.
    pub fn fetch_count(&self, key: &K) -> u64 {
        self.state()
            .entries
            .get(key)
            .map_or(0, |entry| entry.fetch_count)
    }

    /// Write a value directly, e.g. seeding from a one-off read.
    ///
    /// A fetch already in flight for `key` was issued before this value
    /// and is discarded when it resolves. A refetch queued behind it is
    /// started now instead.
    pub fn set_data(&self, key: K, value: V) {
        let job = {
            let mut state = self.state();
            let entry = state.entries.entry(key.clone()).or_insert_with(Entry::new);
            let requeue = entry.in_flight && entry.queued;
            if entry.in_flight {
                tracing::debug!(cache = self.inner.name, key = ?key, "Direct write supersedes in-flight fetch");
                entry.generation += 1;
                entry.in_flight = false;
                entry.queued = false;
            }

            entry.value = Some(value);
            entry.fetched_at = Some(monotonic_now(entry.fetched_at));
            entry.fetched_instant = Some(Instant::now());
            entry.error = None;
            entry.stale = false;

            let job = if requeue && entry.enabled_subscribers() > 0 {
                begin_fetch(key, entry)
            } else {
                None
            };
            entry.publish();
            job
        };

        if let Some(job) = job {
            self.spawn_fetch(job);
        }
    }

    /// Forget a key that has no subscribers. Returns whether it was removed.
    pub fn remove(&self, key: &K) -> bool {
        let mut state = self.state();
        match state.entries.get(key) {
            Some(entry) if entry.subscribers.is_empty() => {
                state.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Mark `key` stale and refetch it if anyone is watching.
    pub fn invalidate(&self, key: &K) {
        let job = {
            let mut state = self.state();
            let Some(entry) = state.entries.get_mut(key) else {
                return;
            };
            entry.stale = true;

            if entry.enabled_subscribers() == 0 {
                None
            } else if entry.in_flight {
                if !entry.queued {
                    tracing::debug!(cache = self.inner.name, key = ?key, "Queueing refetch behind in-flight fetch");
                }
                entry.queued = true;
                None
            } else {
                begin_fetch(key.clone(), entry)
            }
        };

        if let Some(job) = job {
            self.spawn_fetch(job);
        }
    }

    /// Invalidate every key in the cache.
    pub fn invalidate_all(&self) {
        for key in self.keys() {
            self.invalidate(&key);
        }
    }

    /// Watch `key`, fetching it with `fetcher` as needed.
    ///
    /// The newest subscriber's fetcher is used for subsequent fetches.
    /// The returned handle unsubscribes when dropped.
    pub fn subscribe(
        &self,
        key: K,
        fetcher: Fetcher<K, V>,
        options: QueryOptions,
    ) -> QuerySubscription<K, V> {
        let (id, rx, job) = {
            let mut state = self.state();
            let id = state.next_subscriber;
            state.next_subscriber += 1;

            let entry = state.entries.entry(key.clone()).or_insert_with(Entry::new);
            entry.fetcher = Some(fetcher);
            entry.subscribers.insert(
                id,
                SubscriberState {
                    enabled: options.enabled,
                    timer: None,
                },
            );
            let rx = entry.tx.subscribe();

            let job = if options.enabled && !entry.in_flight && entry.needs_fetch(options.stale_time)
            {
                begin_fetch(key.clone(), entry)
            } else {
                None
            };
            (id, rx, job)
        };

        tracing::debug!(cache = self.inner.name, key = ?key, subscriber = id, enabled = options.enabled, "Subscribed");

        if let Some(job) = job {
            self.spawn_fetch(job);
        }
        if let Some(period) = options.refetch_interval {
            let token = self.spawn_refetch_timer(key.clone(), period);
            let mut state = self.state();
            match state
                .entries
                .get_mut(&key)
                .and_then(|entry| entry.subscribers.get_mut(&id))
            {
                Some(sub) => sub.timer = Some(token),
                None => token.cancel(),
            }
        }

        QuerySubscription {
            cache: self.clone(),
            key,
            id,
            rx,
            released: AtomicBool::new(false),
        }
    }

    fn set_enabled(&self, key: &K, id: u64, enabled: bool) {
        let job = {
            let mut state = self.state();
            let Some(entry) = state.entries.get_mut(key) else {
                return;
            };
            let Some(sub) = entry.subscribers.get_mut(&id) else {
                return;
            };
            if sub.enabled == enabled {
                return;
            }
            sub.enabled = enabled;

            if enabled {
                if !entry.in_flight && entry.needs_fetch(Duration::ZERO) {
                    begin_fetch(key.clone(), entry)
                } else {
                    None
                }
            } else {
                if entry.enabled_subscribers() == 0 {
                    entry.orphan_in_flight();
                }
                None
            }
        };

        if let Some(job) = job {
            self.spawn_fetch(job);
        }
    }

    fn release(&self, key: &K, id: u64) {
        let mut state = self.state();
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        if let Some(sub) = entry.subscribers.remove(&id) {
            if let Some(timer) = sub.timer {
                timer.cancel();
            }
        }
        if entry.enabled_subscribers() == 0 {
            if entry.in_flight {
                tracing::debug!(cache = self.inner.name, key = ?key, "Last subscriber left, orphaning in-flight fetch");
            }
            entry.orphan_in_flight();
        }
    }

    fn spawn_fetch(&self, job: FetchJob<K, V>) {
        tracing::debug!(
            cache = self.inner.name,
            key = ?job.key,
            generation = job.generation,
            "Fetching",
        );
        // Build the future outside the lock so a fetcher may touch the cache.
        let future = (job.fetcher)(job.key.clone());
        let cache = self.clone();
        tokio::spawn(async move {
            let result = future.await;
            cache.complete(job.key, job.generation, result);
        });
    }

    fn complete(&self, key: K, generation: u64, result: Result<V, FetchError>) {
        let next = {
            let mut state = self.state();
            let Some(entry) = state.entries.get_mut(&key) else {
                return;
            };
            if !entry.in_flight || entry.generation != generation {
                tracing::debug!(
                    cache = self.inner.name,
                    key = ?key,
                    generation,
                    current = entry.generation,
                    "Discarding result of superseded fetch",
                );
                return;
            }

            entry.in_flight = false;
            match result {
                Ok(value) => {
                    entry.value = Some(value);
                    entry.fetched_at = Some(monotonic_now(entry.fetched_at));
                    entry.fetched_instant = Some(Instant::now());
                    entry.error = None;
                    entry.stale = false;
                }
                Err(e) => {
                    tracing::warn!(cache = self.inner.name, key = ?key, error = %e, "Fetch failed, keeping last value");
                    entry.error = Some(e);
                }
            }

            let next = if entry.queued && entry.enabled_subscribers() > 0 {
                entry.queued = false;
                begin_fetch(key.clone(), entry)
            } else {
                entry.queued = false;
                None
            };
            entry.publish();
            next
        };

        if let Some(job) = next {
            self.spawn_fetch(job);
        }
    }

    fn spawn_refetch_timer(&self, key: K, period: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let cache = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => cache.invalidate(&key),
                }
            }
        });

        token
    }
}

/// Register a new fetch on `entry`. Returns `None` if no fetcher is set.
fn begin_fetch<K, V: Clone>(key: K, entry: &mut Entry<K, V>) -> Option<FetchJob<K, V>> {
    let fetcher = entry.fetcher.clone()?;
    entry.generation += 1;
    entry.in_flight = true;
    entry.queued = false;
    entry.fetch_count += 1;
    entry.publish();
    Some(FetchJob {
        key,
        generation: entry.generation,
        fetcher,
    })
}

/// Wall-clock now, never earlier than `previous`.
fn monotonic_now(previous: Option<Timestamp>) -> Timestamp {
    let now = Utc::now();
    previous.map_or(now, |prev| prev.max(now))
}

// ---------------------------------------------------------------------------
// QuerySubscription
// ---------------------------------------------------------------------------

/// A live interest in one cache key. Dropping it unsubscribes.
pub struct QuerySubscription<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache: QueryCache<K, V>,
    key: K,
    id: u64,
    rx: watch::Receiver<QuerySnapshot<V>>,
    released: AtomicBool,
}

impl<K, V> QuerySubscription<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn snapshot(&self) -> QuerySnapshot<V> {
        self.rx.borrow().clone()
    }

    /// Wait for the next snapshot change. Returns `false` if the cache
    /// entry is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Wait until a snapshot satisfies `predicate` and return it.
    pub async fn wait_for<F>(&mut self, predicate: F) -> Option<QuerySnapshot<V>>
    where
        F: FnMut(&QuerySnapshot<V>) -> bool,
    {
        self.rx.wait_for(predicate).await.ok().map(|snap| snap.clone())
    }

    /// Open or close the fetch gate for this subscription.
    pub fn set_enabled(&self, enabled: bool) {
        if !self.released.load(Ordering::Acquire) {
            self.cache.set_enabled(&self.key, self.id, enabled);
        }
    }

    /// Shorthand for invalidating this subscription's key.
    pub fn refetch(&self) {
        self.cache.invalidate(&self.key);
    }

    /// Stop watching. Calling this more than once is harmless.
    pub fn unsubscribe(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.cache.release(&self.key, self.id);
        }
    }
}

impl<K, V> Drop for QuerySubscription<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(value: u32) -> Fetcher<&'static str, u32> {
        fetcher(move |_key: &'static str| async move { Ok(value) })
    }

    #[test]
    fn get_on_unknown_key_is_none() {
        let cache: QueryCache<&'static str, u32> = QueryCache::new("test");
        assert_eq!(cache.get(&"jobs"), None);
        assert!(cache.snapshot(&"jobs").data.is_none());
    }

    #[test]
    fn invalidate_without_subscribers_only_marks_stale() {
        let cache: QueryCache<&'static str, u32> = QueryCache::new("test");
        cache.set_data("jobs", 1);
        cache.invalidate(&"jobs");
        assert_eq!(cache.fetch_count(&"jobs"), 0);
        assert_eq!(cache.get(&"jobs"), Some(1));
    }

    #[test]
    fn remove_forgets_unwatched_key() {
        let cache: QueryCache<&'static str, u32> = QueryCache::new("test");
        cache.set_data("jobs", 1);
        assert!(cache.remove(&"jobs"));
        assert!(!cache.remove(&"jobs"));
    }

    #[tokio::test]
    async fn subscribe_fetches_and_delivers() {
        let cache = QueryCache::new("test");
        let mut sub = cache.subscribe("jobs", constant(7), QueryOptions::default());

        let snap = sub.wait_for(|s| s.data.is_some()).await.unwrap();
        assert_eq!(snap.data, Some(7));
        assert!(!snap.is_loading);
        assert!(snap.fetched_at.is_some());
        assert_eq!(cache.get(&"jobs"), Some(7));
    }

    #[tokio::test]
    async fn disabled_subscription_does_not_fetch() {
        let cache = QueryCache::new("test");
        let sub = cache.subscribe(
            "detail",
            constant(1),
            QueryOptions {
                enabled: false,
                ..Default::default()
            },
        );
        tokio::task::yield_now().await;
        assert_eq!(cache.fetch_count(&"detail"), 0);
        assert_eq!(cache.subscriber_count(&"detail"), 1);
        assert!(!cache.remove(&"detail"));

        sub.set_enabled(true);
        assert_eq!(cache.fetch_count(&"detail"), 1);
    }

    #[tokio::test]
    async fn fresh_value_within_stale_time_is_reused() {
        let cache = QueryCache::new("test");
        cache.set_data("jobs", 3);

        let _sub = cache.subscribe(
            "jobs",
            constant(4),
            QueryOptions {
                stale_time: Duration::from_secs(60),
                ..Default::default()
            },
        );
        assert_eq!(cache.fetch_count(&"jobs"), 0);
        assert_eq!(cache.get(&"jobs"), Some(3));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let cache = QueryCache::new("test");
        let sub = cache.subscribe("jobs", constant(1), QueryOptions::default());
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(cache.subscriber_count(&"jobs"), 0);
        drop(sub);
        assert_eq!(cache.subscriber_count(&"jobs"), 0);
    }
}
