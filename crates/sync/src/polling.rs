//! Reference-counted status polling.
//!
//! A [`PollingCoordinator`] invalidates one cache key on a fixed interval
//! for as long as at least one consumer holds a [`PollGuard`]. Any number
//! of consumers share a single ticker; the first attach starts it and the
//! last guard to drop stops it. Polling is the backstop that keeps the
//! view converging when push events are missed or the transport is down.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::QueryCache;

struct PollState {
    consumers: usize,
    cancel: Option<CancellationToken>,
}

struct PollInner<K, V> {
    cache: QueryCache<K, V>,
    key: K,
    interval: Duration,
    state: Mutex<PollState>,
}

impl<K, V> PollInner<K, V> {
    fn state(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared fixed-interval invalidation of one cache key.
pub struct PollingCoordinator<K, V> {
    inner: Arc<PollInner<K, V>>,
}

impl<K, V> Clone for PollingCoordinator<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> PollingCoordinator<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(cache: QueryCache<K, V>, key: K, interval: Duration) -> Self {
        Self {
            inner: Arc::new(PollInner {
                cache,
                key,
                interval,
                state: Mutex::new(PollState {
                    consumers: 0,
                    cancel: None,
                }),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Register a consumer. Polling runs while any guard is alive.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self) -> PollGuard {
        let mut state = self.inner.state();
        state.consumers += 1;
        if state.cancel.is_none() {
            let cancel = CancellationToken::new();
            state.cancel = Some(cancel.clone());
            self.spawn_ticker(cancel);
        }
        tracing::debug!(consumers = state.consumers, key = ?self.inner.key, "Poll consumer attached");
        drop(state);

        let inner = Arc::clone(&self.inner);
        PollGuard {
            release: Some(Box::new(move || release(&inner))),
        }
    }

    /// A ticker is currently running.
    pub fn is_active(&self) -> bool {
        self.inner.state().cancel.is_some()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.state().consumers
    }

    fn spawn_ticker(&self, cancel: CancellationToken) {
        let cache = self.inner.cache.clone();
        let key = self.inner.key.clone();
        let period = self.inner.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(poll_interval_ms = period.as_millis() as u64, "Status polling started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Status polling stopped");
                        break;
                    }
                    _ = ticker.tick() => cache.invalidate(&key),
                }
            }
        });
    }
}

fn release<K, V>(inner: &PollInner<K, V>) {
    let mut state = inner.state();
    state.consumers = state.consumers.saturating_sub(1);
    if state.consumers == 0 {
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
    }
}

/// Keeps polling alive. Dropping the guard detaches its consumer.
pub struct PollGuard {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl PollGuard {
    /// Detach now instead of on drop.
    pub fn detach(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for PollGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollGuard")
            .field("attached", &self.release.is_some())
            .finish()
    }
}
