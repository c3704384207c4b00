//! Collection-run lifecycle controller.
//!
//! [`JobController`] is the single entry point the rest of the
//! application uses for collection runs. It owns three query caches:
//!
//! - `jobs` keyed by list limit,
//! - `job-status` (a single `()` key, kept fresh by a [`PollingCoordinator`]),
//! - `job-detail` keyed by [`JobId`], fetched only while a detail view is open.
//!
//! The controller never moves a job between states itself. Commands are
//! sent to the remote executor and the caches are invalidated; the new
//! state arrives through refetches triggered by the command, by
//! `job_status` push events, or by polling.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use newsdesk_core::job::{
    diff_jobs, CommandAck, Job, JobChange, JobDetail, StartOptions, StatusSummary,
};
use newsdesk_core::job_events::MSG_TYPE_JOB_TRANSITION;
use newsdesk_core::types::{JobId, Timestamp};
use newsdesk_events::{EventBus, Subscription, Topic};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{fetcher, Fetcher, QueryCache, QueryOptions, QuerySubscription};
use crate::config::SyncConfig;
use crate::error::CommandError;
use crate::polling::{PollGuard, PollingCoordinator};
use crate::remote::JobsRemote;

/// Status view plus the polling it keeps alive.
///
/// Derefs to the underlying [`QuerySubscription`]. Dropping it detaches
/// from polling.
pub struct StatusWatch {
    query: QuerySubscription<(), StatusSummary>,
    _poll: PollGuard,
}

impl std::ops::Deref for StatusWatch {
    type Target = QuerySubscription<(), StatusSummary>;

    fn deref(&self) -> &Self::Target {
        &self.query
    }
}

impl std::ops::DerefMut for StatusWatch {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.query
    }
}

/// Clears the pending-start flag when the start command finishes,
/// including when the caller drops the future.
struct PendingStart<'a>(&'a AtomicBool);

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct JobController {
    remote: Arc<dyn JobsRemote>,
    config: SyncConfig,
    jobs: QueryCache<usize, Vec<Job>>,
    status: QueryCache<(), StatusSummary>,
    details: QueryCache<JobId, JobDetail>,
    poller: PollingCoordinator<(), StatusSummary>,
    selected: Mutex<Option<JobId>>,
    start_pending: AtomicBool,
    /// When the last start was accepted, until a later refresh lands.
    accepted_start: Mutex<Option<Timestamp>>,
    bindings: Mutex<Vec<Subscription>>,
}

impl JobController {
    pub fn new(remote: Arc<dyn JobsRemote>, config: SyncConfig) -> Self {
        let status = QueryCache::new("job-status");
        let poller = PollingCoordinator::new(status.clone(), (), config.poll_interval);
        Self {
            remote,
            config,
            jobs: QueryCache::new("jobs"),
            status,
            details: QueryCache::new("job-detail"),
            poller,
            selected: Mutex::new(None),
            start_pending: AtomicBool::new(false),
            accepted_start: Mutex::new(None),
            bindings: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn jobs_cache(&self) -> &QueryCache<usize, Vec<Job>> {
        &self.jobs
    }

    pub fn status_cache(&self) -> &QueryCache<(), StatusSummary> {
        &self.status
    }

    pub fn detail_cache(&self) -> &QueryCache<JobId, JobDetail> {
        &self.details
    }

    pub fn poller(&self) -> &PollingCoordinator<(), StatusSummary> {
        &self.poller
    }

    // ---- fetchers ----

    fn jobs_fetcher(&self) -> Fetcher<usize, Vec<Job>> {
        let remote = Arc::clone(&self.remote);
        fetcher(move |limit| {
            let remote = Arc::clone(&remote);
            async move { remote.fetch_jobs(limit).await }
        })
    }

    fn status_fetcher(&self) -> Fetcher<(), StatusSummary> {
        let remote = Arc::clone(&self.remote);
        fetcher(move |()| {
            let remote = Arc::clone(&remote);
            async move { remote.fetch_job_status().await }
        })
    }

    fn detail_fetcher(&self) -> Fetcher<JobId, JobDetail> {
        let remote = Arc::clone(&self.remote);
        fetcher(move |id| {
            let remote = Arc::clone(&remote);
            async move { remote.fetch_job_detail(id).await }
        })
    }

    // ---- views ----

    /// Subscribe to the job list (newest first, configured limit). The
    /// list also refetches on the polling interval while watched.
    pub fn watch_jobs(&self) -> QuerySubscription<usize, Vec<Job>> {
        self.jobs.subscribe(
            self.config.job_list_limit,
            self.jobs_fetcher(),
            QueryOptions {
                refetch_interval: Some(self.config.poll_interval),
                ..Default::default()
            },
        )
    }

    /// Subscribe to the collector status and keep it polled while the
    /// returned watch is alive.
    pub fn watch_status(&self) -> StatusWatch {
        let query = self
            .status
            .subscribe((), self.status_fetcher(), QueryOptions::default());
        StatusWatch {
            query,
            _poll: self.poller.attach(),
        }
    }

    /// Make `job_id` the inspected job and return its detail view with
    /// the fetch gate closed. Call `set_enabled(true)` on the view when
    /// the detail is actually shown.
    pub fn select_for_detail(&self, job_id: JobId) -> QuerySubscription<JobId, JobDetail> {
        self.subscribe_detail(job_id, false)
    }

    /// Select `job_id` and fetch its detail right away.
    pub fn open_detail(&self, job_id: JobId) -> QuerySubscription<JobId, JobDetail> {
        self.subscribe_detail(job_id, true)
    }

    fn subscribe_detail(&self, job_id: JobId, enabled: bool) -> QuerySubscription<JobId, JobDetail> {
        *self.selected() = Some(job_id);
        self.prune_details(Some(job_id));
        tracing::debug!(job_id, enabled, "Job selected for detail");
        self.details.subscribe(
            job_id,
            self.detail_fetcher(),
            QueryOptions {
                enabled,
                ..Default::default()
            },
        )
    }

    pub fn selected_job(&self) -> Option<JobId> {
        *self.selected()
    }

    pub fn clear_selection(&self) {
        *self.selected() = None;
        self.prune_details(None);
    }

    /// Drop cached details nobody is viewing, except `keep`.
    fn prune_details(&self, keep: Option<JobId>) {
        for id in self.details.keys() {
            if Some(id) != keep && self.details.remove(&id) {
                tracing::debug!(job_id = id, "Dropped unwatched job detail");
            }
        }
    }

    fn selected(&self) -> MutexGuard<'_, Option<JobId>> {
        self.selected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the local view shows a run in progress. `None` when
    /// neither the status nor the job list has been loaded yet.
    pub fn local_running(&self) -> Option<bool> {
        let from_status = self.status.get(&()).map(|s| s.status.is_running());
        let from_jobs = self
            .jobs
            .get(&self.config.job_list_limit)
            .map(|jobs| jobs.iter().any(Job::is_running));

        match (from_status, from_jobs) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(false) || b.unwrap_or(false)),
        }
    }

    /// The start action is enabled: nothing is running locally, no start
    /// command is pending, and the state has been refreshed since the last
    /// accepted start.
    pub fn can_start(&self) -> bool {
        self.local_running() != Some(true)
            && !self.start_pending.load(Ordering::Acquire)
            && !self.awaiting_refresh()
    }

    /// An accepted start has not yet been followed by a completed status
    /// or job list fetch.
    fn awaiting_refresh(&self) -> bool {
        let mut accepted = self
            .accepted_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(accepted_at) = *accepted else {
            return false;
        };

        let refreshed = |loading: bool, fetched_at: Option<Timestamp>| {
            !loading && fetched_at.is_some_and(|at| at > accepted_at)
        };
        let status = self.status.snapshot(&());
        let jobs = self.jobs.snapshot(&self.config.job_list_limit);
        if refreshed(status.is_loading, status.fetched_at)
            || refreshed(jobs.is_loading, jobs.fetched_at)
        {
            *accepted = None;
            false
        } else {
            true
        }
    }

    // ---- commands ----

    /// Ask the executor to start a collection run.
    pub async fn start(&self, options: StartOptions) -> Result<CommandAck, CommandError> {
        options.validate()?;

        if self.local_running() == Some(true) {
            tracing::info!("Start refused locally, a run is already in progress");
            return Err(CommandError::Rejected(
                "A collection run is already in progress".into(),
            ));
        }
        if self
            .start_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::info!("Start refused locally, a start command is already pending");
            return Err(CommandError::Rejected(
                "A start command is already pending".into(),
            ));
        }
        let _pending = PendingStart(&self.start_pending);

        tracing::info!(
            source_ids = ?options.source_ids,
            max_items_per_source = ?options.max_items_per_source,
            "Sending start command",
        );
        let result = self.with_timeout(self.remote.start_job(&options)).await;
        self.finish_command("start", result)
    }

    /// Ask the executor to stop the current run.
    ///
    /// Advisory: success means the request was accepted, not that the
    /// run has stopped. The run's terminal state arrives via refetch.
    pub async fn stop(&self) -> Result<CommandAck, CommandError> {
        let running = match self.local_running() {
            Some(running) => running,
            None => {
                let status = self.with_timeout(self.remote.fetch_job_status()).await??;
                let running = status.status.is_running();
                self.status.set_data((), status);
                running
            }
        };
        if !running {
            tracing::info!("Stop requested with no run in progress");
            return Err(CommandError::NoRunningJob);
        }

        tracing::info!("Sending stop command");
        let result = self.with_timeout(self.remote.stop_job()).await;
        self.finish_command("stop", result)
    }

    async fn with_timeout<F, T>(&self, future: F) -> Result<T, CommandError>
    where
        F: Future<Output = T>,
    {
        let limit = self.config.request_timeout;
        tokio::time::timeout(limit, future)
            .await
            .map_err(|_| CommandError::Timeout(limit))
    }

    fn finish_command(
        &self,
        command: &'static str,
        result: Result<Result<CommandAck, CommandError>, CommandError>,
    ) -> Result<CommandAck, CommandError> {
        match result.and_then(|inner| inner) {
            Ok(ack) if ack.accepted => {
                tracing::info!(command, message = ?ack.message, "Command accepted");
                if command == "start" {
                    *self
                        .accepted_start
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
                }
                self.invalidate_job_state();
                Ok(ack)
            }
            Ok(ack) => {
                let message = ack
                    .message
                    .unwrap_or_else(|| format!("{command} command was not accepted"));
                tracing::warn!(command, %message, "Command refused by executor");
                self.invalidate_job_state();
                Err(CommandError::Rejected(message))
            }
            Err(e @ CommandError::Rejected(_)) => {
                tracing::warn!(command, error = %e, "Command refused by executor");
                // Our view was behind; catch up.
                self.invalidate_job_state();
                Err(e)
            }
            Err(e) => {
                tracing::error!(command, error = %e, "Command failed");
                Err(e)
            }
        }
    }

    // ---- invalidation & bus binding ----

    /// Refetch everything that describes the current run: the job list,
    /// the status and the open detail view, if any.
    pub fn invalidate_job_state(&self) {
        self.jobs.invalidate_all();
        self.status.invalidate(&());
        if let Some(id) = self.selected_job() {
            self.details.invalidate(&id);
        }
    }

    /// Invalidate job state on every `job_status` push and after every
    /// (re)connect. Replaces any earlier binding.
    pub fn bind(self: &Arc<Self>, bus: &EventBus) {
        let mut subscriptions = Vec::with_capacity(2);
        for topic in [Topic::JobStatus, Topic::Connected] {
            let controller: Weak<Self> = Arc::downgrade(self);
            subscriptions.push(bus.on(topic, move |event| {
                if let Some(controller) = controller.upgrade() {
                    tracing::debug!(topic = %event.topic, "Invalidating job state");
                    controller.invalidate_job_state();
                }
                Ok(())
            }));
        }

        let old = std::mem::replace(&mut *self.bindings(), subscriptions);
        drop(old);
    }

    /// Remove the bus listeners installed by [`bind`](Self::bind).
    pub fn unbind(&self) {
        let old = std::mem::take(&mut *self.bindings());
        drop(old);
    }

    fn bindings(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Watch the job list and publish every observed change as a
    /// `job_transition` event on `bus`. Jobs that break the record
    /// invariants are logged and kept.
    pub fn spawn_transition_tracker(
        &self,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut subscription = self.jobs.subscribe(
            self.config.job_list_limit,
            self.jobs_fetcher(),
            QueryOptions::default(),
        );

        tokio::spawn(async move {
            let mut previous: Option<Vec<Job>> = None;
            loop {
                if let Some(current) = subscription.snapshot().data {
                    if previous.as_ref() != Some(&current) {
                        report_changes(&bus, previous.as_deref(), &current);
                        previous = Some(current);
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    alive = subscription.changed() => {
                        if !alive {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Transition tracker stopped");
        })
    }
}

/// Validate the new list and publish its differences from `previous`.
/// The first list seen is only validated.
fn report_changes(bus: &EventBus, previous: Option<&[Job]>, current: &[Job]) {
    for job in current {
        if let Err(e) = job.validate() {
            tracing::warn!(job_id = job.id, error = %e, "Server reported an inconsistent job");
        }
    }

    let Some(previous) = previous else {
        return;
    };
    for change in diff_jobs(previous, current) {
        match &change {
            JobChange::Appeared { id, status } => {
                tracing::info!(job_id = id, status = %status, "Job appeared");
            }
            JobChange::Transitioned { id, from, to } => {
                tracing::info!(job_id = id, from = %from, to = %to, "Job transitioned");
            }
            JobChange::Regressed { .. } | JobChange::CountersDecreased { .. } => {
                if let Some(e) = change.as_error() {
                    tracing::warn!(job_id = change.job_id(), error = %e, "Illegal job transition");
                } else {
                    tracing::warn!(job_id = change.job_id(), "Job counters decreased while running");
                }
            }
        }

        match serde_json::to_value(&change) {
            Ok(payload) => {
                bus.emit(Topic::Custom(MSG_TYPE_JOB_TRANSITION.to_string()), payload);
            }
            Err(e) => tracing::warn!(error = %e, "Could not serialize job change"),
        }
    }
}
