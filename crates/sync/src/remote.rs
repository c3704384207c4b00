//! The remote command boundary consumed by the tracker.
//!
//! The tracker never talks to the network directly; every read and
//! command goes through [`JobsRemote`]. [`HttpJobsRemote`](crate::api::HttpJobsRemote)
//! is the production implementation, tests script their own.

use async_trait::async_trait;
use newsdesk_core::job::{CommandAck, Job, JobDetail, StartOptions, StatusSummary};
use newsdesk_core::types::JobId;

use crate::error::{CommandError, FetchError};

#[async_trait]
pub trait JobsRemote: Send + Sync {
    /// Most recent runs, newest first.
    async fn fetch_jobs(&self, limit: usize) -> Result<Vec<Job>, FetchError>;

    /// Full detail for one run.
    async fn fetch_job_detail(&self, id: JobId) -> Result<JobDetail, FetchError>;

    /// Collector-wide status summary.
    async fn fetch_job_status(&self) -> Result<StatusSummary, FetchError>;

    /// Ask the executor to start a run. A refusal because a run is
    /// already in progress is reported as [`CommandError::Rejected`].
    async fn start_job(&self, options: &StartOptions) -> Result<CommandAck, CommandError>;

    /// Ask the executor to stop the current run. Advisory: the run may
    /// take a while to reach a terminal state.
    async fn stop_job(&self) -> Result<CommandAck, CommandError>;
}
