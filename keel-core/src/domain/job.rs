//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Marker stored in `result_stdout` when no output could be captured
pub const STDOUT_MISSING: &str = "stdout capture is missing";

/// Job execution status
///
/// `New` is the status the API layer creates the record with. From there the
/// engine drives `Pending -> (Waiting)? -> Running -> terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    New,
    Pending,
    Waiting,
    Running,
    Successful,
    Failed,
    Error,
    Canceled,
}

impl JobStatus {
    /// Terminal statuses are sinks
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Successful | JobStatus::Failed | JobStatus::Error | JobStatus::Canceled
        )
    }

    /// Whether the job counts as failed once it reaches this status
    pub fn is_failure(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Error)
    }

    /// Checks whether moving from `self` to `next` is a legal transition
    ///
    /// Cancellation may preempt any non-terminal status, and failures may be
    /// recorded from any non-terminal status because bookkeeping can break
    /// before the job ever started running.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }

        match next {
            JobStatus::New => false,
            JobStatus::Pending => matches!(self, JobStatus::New | JobStatus::Pending),
            JobStatus::Waiting => self == JobStatus::Pending,
            JobStatus::Running => matches!(self, JobStatus::Pending | JobStatus::Waiting),
            JobStatus::Successful => self == JobStatus::Running,
            JobStatus::Failed | JobStatus::Error | JobStatus::Canceled => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Pending => "pending",
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a job was launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchType {
    #[default]
    Manual,
    System,
    Callback,
    Scheduled,
}

impl LaunchType {
    pub fn as_str(self) -> &'static str {
        match self {
            LaunchType::Manual => "manual",
            LaunchType::System => "system",
            LaunchType::Callback => "callback",
            LaunchType::Scheduled => "scheduled",
        }
    }
}

/// Job execution record
///
/// Common bookkeeping fields live here; the tool-family specific options are
/// flattened in from `S` (see [`crate::domain::ansible::PlaybookOptions`] and
/// [`crate::domain::terraform::TerraformOptions`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<S> {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub launch_type: LaunchType,
    #[serde(default)]
    pub cancel_flag: bool,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    /// Run time in minutes
    #[serde(default)]
    pub elapsed: f64,
    #[serde(default)]
    pub result_stdout: String,
    #[serde(default)]
    pub job_explanation: String,
    #[serde(default)]
    pub job_args: Vec<String>,
    #[serde(default)]
    pub job_env: Vec<String>,
    #[serde(default)]
    pub job_cwd: String,

    pub job_template_id: Uuid,
    pub project_id: Uuid,
    #[serde(default)]
    pub created_by_id: Option<Uuid>,

    #[serde(flatten)]
    pub spec: S,
}

impl<S> Job<S> {
    /// Records the finishing time and derives `elapsed`
    ///
    /// A job that never reached `running` gets `started = finished` so that
    /// `elapsed` stays `finished - started`.
    pub fn mark_finished(&mut self, finished: DateTime<Utc>) {
        let started = *self.started.get_or_insert(finished);
        self.finished = Some(finished);
        self.elapsed = elapsed_minutes(started, finished);
    }
}

/// Minutes between two instants, clamped at zero
pub fn elapsed_minutes(started: DateTime<Utc>, finished: DateTime<Utc>) -> f64 {
    let millis = (finished - started).num_milliseconds().max(0);
    millis as f64 / 60_000.0
}
