//! Collection-run model and lifecycle rules.
//!
//! A [`Job`] is one server-executed collection run. Its status only ever
//! moves `running -> completed` or `running -> error`; both end states are
//! terminal. The client never drives these transitions itself, it only
//! observes them through refetched job lists, so the helpers here exist to
//! interpret and sanity-check what the server reports.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Error,
}

impl JobStatus {
    /// `completed` and `error` are final; nothing leaves them.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Staying in the same state is always allowed (a refetch that
    /// reports no change is not a transition).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        self == next || self == JobStatus::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One collection run as reported by the job list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub new_items_count: u32,
    #[serde(default)]
    pub total_sources: u32,
    #[serde(default)]
    pub success_sources: u32,
    #[serde(default)]
    pub failed_sources: u32,
    /// Wall-clock seconds, present once the run has left `running`.
    pub duration: Option<f64>,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    /// Check the cross-field invariants of a job record.
    ///
    /// - `completed_at` is set iff the job is no longer running.
    /// - `error_message` is set iff the status is `error`.
    /// - `duration`, when set, is positive and only present on finished jobs.
    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |reason: &str| CoreError::InvalidJob {
            id: self.id,
            reason: reason.to_string(),
        };

        if self.is_running() == self.completed_at.is_some() {
            return Err(invalid(
                "completed_at must be set exactly when the job is not running",
            ));
        }
        if (self.status == JobStatus::Error) != self.error_message.is_some() {
            return Err(invalid(
                "error_message must be present exactly when status is error",
            ));
        }
        if let Some(duration) = self.duration {
            if self.is_running() {
                return Err(invalid("running job must not report a duration"));
            }
            if duration.is_nan() || duration <= 0.0 {
                return Err(invalid("duration must be positive"));
            }
        }
        let finished = u64::from(self.success_sources) + u64::from(self.failed_sources);
        if finished > u64::from(self.total_sources) {
            return Err(invalid("finished sources exceed total_sources"));
        }
        Ok(())
    }

    /// Counters of `self` are all >= those of `earlier`.
    fn counters_at_least(&self, earlier: &Job) -> bool {
        self.new_items_count >= earlier.new_items_count
            && self.total_sources >= earlier.total_sources
            && self.success_sources >= earlier.success_sources
            && self.failed_sources >= earlier.failed_sources
    }
}

// ---------------------------------------------------------------------------
// JobDetail
// ---------------------------------------------------------------------------

/// Outcome of one source within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLog {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
    /// Number of items fetched; absent for failed sources.
    pub item_count: Option<u32>,
    /// Failure reason; absent for successful sources.
    pub error_message: Option<String>,
    pub started_at: Timestamp,
}

/// An article discovered during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub title: String,
    pub url: String,
    pub source_name: Option<String>,
    pub published_at: Option<Timestamp>,
}

/// Deep view of a single run. Only fetched while someone is inspecting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    #[serde(default)]
    pub success_logs: Vec<SourceLog>,
    #[serde(default)]
    pub failed_logs: Vec<SourceLog>,
    #[serde(default)]
    pub new_items: Vec<NewItem>,
}

// ---------------------------------------------------------------------------
// Status summary and commands
// ---------------------------------------------------------------------------

/// Collector-wide state as reported by the status endpoint.
///
/// Unlike [`JobStatus`] this has an `idle` state for "no run has ever
/// been started"; anything the client does not recognise maps to `idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Running,
    Completed,
    Error,
    #[serde(other)]
    Idle,
}

impl RunnerStatus {
    pub fn is_running(self) -> bool {
        self == RunnerStatus::Running
    }
}

impl From<JobStatus> for RunnerStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Running => RunnerStatus::Running,
            JobStatus::Completed => RunnerStatus::Completed,
            JobStatus::Error => RunnerStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub status: RunnerStatus,
    #[serde(default)]
    pub message: Option<String>,
}

/// Parameters for starting a collection run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Restrict the run to these sources; `None` collects from all enabled sources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ids: Option<Vec<i64>>,
    /// Cap on items taken from each source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_items_per_source: Option<u32>,
}

impl StartOptions {
    pub fn validate(&self) -> Result<(), CoreError> {
        if let Some(ids) = &self.source_ids {
            if ids.is_empty() {
                return Err(CoreError::Validation(
                    "source_ids must not be empty when given".into(),
                ));
            }
        }
        if self.max_items_per_source == Some(0) {
            return Err(CoreError::Validation(
                "max_items_per_source must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Server acknowledgement of a start or stop command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub accepted: bool,
    #[serde(default)]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Diffing successive job lists
// ---------------------------------------------------------------------------

/// A difference between two snapshots of the job list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobChange {
    /// A job not present in the previous snapshot.
    Appeared { id: JobId, status: JobStatus },
    /// A legal status change (`running` to a terminal state).
    Transitioned {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    /// The server reported a change the state machine forbids.
    Regressed {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    /// A still-running job reported smaller counters than before.
    CountersDecreased { id: JobId },
}

impl JobChange {
    pub fn job_id(&self) -> JobId {
        match self {
            JobChange::Appeared { id, .. }
            | JobChange::Transitioned { id, .. }
            | JobChange::Regressed { id, .. }
            | JobChange::CountersDecreased { id } => *id,
        }
    }

    /// Convert a regression into the matching [`CoreError`].
    pub fn as_error(&self) -> Option<CoreError> {
        match self {
            JobChange::Regressed { id, from, to } => Some(CoreError::IllegalTransition {
                id: *id,
                from: *from,
                to: *to,
            }),
            _ => None,
        }
    }
}

/// Compare two job-list snapshots and report what changed, in the order
/// jobs appear in `next`. Jobs that vanished from the list are not
/// reported (the list endpoint is limited, old runs scroll off).
pub fn diff_jobs(previous: &[Job], next: &[Job]) -> Vec<JobChange> {
    let before: HashMap<JobId, &Job> = previous.iter().map(|job| (job.id, job)).collect();
    let mut changes = Vec::new();

    for job in next {
        let Some(old) = before.get(&job.id) else {
            changes.push(JobChange::Appeared {
                id: job.id,
                status: job.status,
            });
            continue;
        };

        if old.status != job.status {
            if old.status.can_transition_to(job.status) {
                changes.push(JobChange::Transitioned {
                    id: job.id,
                    from: old.status,
                    to: job.status,
                });
            } else {
                changes.push(JobChange::Regressed {
                    id: job.id,
                    from: old.status,
                    to: job.status,
                });
            }
        } else if job.is_running() && !job.counters_at_least(old) {
            changes.push(JobChange::CountersDecreased { id: job.id });
        }
    }

    changes
}
