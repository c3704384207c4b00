#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use newsdesk_core::job::{
    CommandAck, Job, JobDetail, JobStatus, RunnerStatus, StartOptions, StatusSummary,
};
use newsdesk_core::types::JobId;
use newsdesk_sync::{CommandError, FetchError, JobController, JobsRemote, SyncConfig};

/// Build a test `SyncConfig`: 2 s polling, 30 s command timeout.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        api_url: "http://localhost:8000".to_string(),
        ws_url: "ws://localhost:8000".to_string(),
        request_timeout: Duration::from_secs(30),
        poll_interval: Duration::from_millis(2000),
        reconnect_delay: Duration::from_secs(3),
        job_list_limit: 20,
    }
}

pub fn running_job(id: JobId) -> Job {
    Job {
        id,
        status: JobStatus::Running,
        new_items_count: 0,
        total_sources: 4,
        success_sources: 0,
        failed_sources: 0,
        duration: None,
        started_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        completed_at: None,
        error_message: None,
    }
}

pub fn completed_job(id: JobId, duration: f64) -> Job {
    Job {
        status: JobStatus::Completed,
        success_sources: 4,
        new_items_count: 12,
        duration: Some(duration),
        completed_at: Some(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 12).unwrap()),
        ..running_job(id)
    }
}

pub fn detail_for(job: Job) -> JobDetail {
    JobDetail {
        job,
        success_logs: Vec::new(),
        failed_logs: Vec::new(),
        new_items: Vec::new(),
    }
}

pub fn idle_status() -> StatusSummary {
    StatusSummary {
        status: RunnerStatus::Idle,
        message: None,
    }
}

#[derive(Default)]
struct RemoteState {
    jobs: Vec<Job>,
    next_id: JobId,
    fail_jobs: Option<FetchError>,
}

/// Delays applied to each remote call (tokio time, so they respect a
/// paused clock).
#[derive(Debug, Clone, Default)]
pub struct Delays {
    pub jobs: Duration,
    pub status: Duration,
    pub detail: Duration,
    pub command: Duration,
}

/// In-memory stand-in for the collection service.
///
/// Behaves like the real executor: `start` is refused while a run is in
/// progress, `stop` only acknowledges. Every call is counted.
#[derive(Default)]
pub struct ScriptedRemote {
    state: Mutex<RemoteState>,
    pub delays: Mutex<Delays>,
    pub jobs_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub detail_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        let remote = Self::default();
        remote.state.lock().unwrap().next_id = 1;
        Arc::new(remote)
    }

    pub fn with_jobs(jobs: Vec<Job>) -> Arc<Self> {
        let remote = Self::new();
        remote.set_jobs(jobs);
        remote
    }

    pub fn set_jobs(&self, jobs: Vec<Job>) {
        let mut state = self.state.lock().unwrap();
        state.next_id = jobs.iter().map(|j| j.id).max().unwrap_or(0) + 1;
        state.jobs = jobs;
    }

    pub fn set_delays(&self, delays: Delays) {
        *self.delays.lock().unwrap() = delays;
    }

    pub fn fail_jobs_with(&self, error: Option<FetchError>) {
        self.state.lock().unwrap().fail_jobs = error;
    }

    /// Finish job `id` as the executor would.
    pub fn complete_job(&self, id: JobId, duration: f64) {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) {
            *job = completed_job(id, duration);
        }
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Sleep for the selected delay; zero delays do not touch the timer.
    async fn pause(&self, pick: impl Fn(&Delays) -> Duration) {
        let delay = pick(&self.delays.lock().unwrap());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn current_status(state: &RemoteState) -> StatusSummary {
        match state.jobs.first() {
            Some(job) => StatusSummary {
                status: job.status.into(),
                message: None,
            },
            None => idle_status(),
        }
    }
}

#[async_trait]
impl JobsRemote for ScriptedRemote {
    async fn fetch_jobs(&self, limit: usize) -> Result<Vec<Job>, FetchError> {
        self.jobs_calls.fetch_add(1, Ordering::SeqCst);
        self.pause(|d| d.jobs).await;
        let state = self.state.lock().unwrap();
        if let Some(e) = &state.fail_jobs {
            return Err(e.clone());
        }
        Ok(state.jobs.iter().take(limit).cloned().collect())
    }

    async fn fetch_job_detail(&self, id: JobId) -> Result<JobDetail, FetchError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        self.pause(|d| d.detail).await;
        let state = self.state.lock().unwrap();
        state
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .map(detail_for)
            .ok_or(FetchError::Api {
                status: 404,
                body: format!("job {id} not found"),
            })
    }

    async fn fetch_job_status(&self) -> Result<StatusSummary, FetchError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        // Answered on arrival, delivered after the delay.
        let status = Self::current_status(&self.state.lock().unwrap());
        self.pause(|d| d.status).await;
        Ok(status)
    }

    async fn start_job(&self, _options: &StartOptions) -> Result<CommandAck, CommandError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.pause(|d| d.command).await;
        let mut state = self.state.lock().unwrap();
        if state.jobs.iter().any(Job::is_running) {
            return Err(CommandError::Rejected(
                "A collection run is already in progress".into(),
            ));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.jobs.insert(0, running_job(id));
        Ok(CommandAck {
            accepted: true,
            message: Some(format!("started run {id}")),
        })
    }

    async fn stop_job(&self) -> Result<CommandAck, CommandError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.pause(|d| d.command).await;
        Ok(CommandAck {
            accepted: true,
            message: Some("stop requested".into()),
        })
    }
}

/// Controller over `remote` with [`test_config`].
pub fn controller(remote: &Arc<ScriptedRemote>) -> Arc<JobController> {
    let remote: Arc<dyn JobsRemote> = Arc::clone(remote) as Arc<dyn JobsRemote>;
    Arc::new(JobController::new(remote, test_config()))
}
