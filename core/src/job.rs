use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle state of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for (re)execution.
    Pending,
    /// Handler currently in flight.
    Running,
    /// Handler succeeded.
    Completed,
    /// Retries exhausted or no handler registered.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// `completed`, `failed` and `cancelled` admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown status {s}"))
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique id (UUID v7).
    pub id: String,
    /// Selects the registered handler.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Input for the handler.
    #[serde(default)]
    pub payload: Value,
    /// Handler output; only set once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Last failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Retry ceiling.
    pub max_retries: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First time the job went `running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Time the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Not eligible for execution before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh `pending` job with a newly allocated id.
    pub fn new(job_type: impl Into<String>, payload: Value, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            job_type: job_type.into(),
            status: JobStatus::Pending,
            payload,
            result: None,
            error: None,
            retry_count: 0,
            max_retries,
            created_at: now,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
        }
    }

    /// Whether a `pending` job may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Completion time used by the retention sweep.
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }
}

/// Severity of a [`JobLog`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Normal progress.
    Info,
    /// Something skipped or ignored.
    Warn,
    /// A failure.
    Error,
    /// Diagnostics.
    Debug,
}

/// Append-only per-job log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    /// Owning job.
    pub job_id: String,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Selection for [`crate::manager::JobManager::get_jobs`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    /// Keep only this status.
    #[serde(default)]
    pub status: Option<JobStatus>,
    /// Keep only this job type.
    #[serde(default, rename = "type")]
    pub job_type: Option<String>,
    /// Truncate after this many (newest first).
    #[serde(default)]
    pub limit: Option<usize>,
}

impl JobFilter {
    /// Jobs in `status`.
    pub fn status(status: JobStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    /// Restrict to one job type.
    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Cap the number of returned jobs.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.job_type.as_deref().map_or(true, |t| job.job_type == t)
    }
}

/// Options for [`crate::manager::JobManager::create_job`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Overrides the configured default retry ceiling.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Shallow field update for [`crate::manager::JobManager::update_job`].
///
/// `Some` fields overwrite; `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    /// New status.
    pub status: Option<JobStatus>,
    /// New payload.
    pub payload: Option<Value>,
    /// New result (`Some(None)` clears it).
    pub result: Option<Option<Value>>,
    /// New error (`Some(None)` clears it).
    pub error: Option<Option<String>>,
    /// New retry count.
    pub retry_count: Option<u32>,
    /// New retry ceiling.
    pub max_retries: Option<u32>,
    /// New start time.
    pub started_at: Option<Option<DateTime<Utc>>>,
    /// New completion time.
    pub completed_at: Option<Option<DateTime<Utc>>>,
    /// New retry due-time.
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
}

impl JobPatch {
    pub(crate) fn apply(self, job: &mut Job) {
        if let Some(v) = self.status { job.status = v; }
        if let Some(v) = self.payload { job.payload = v; }
        if let Some(v) = self.result { job.result = v; }
        if let Some(v) = self.error { job.error = v; }
        if let Some(v) = self.retry_count { job.retry_count = v; }
        if let Some(v) = self.max_retries { job.max_retries = v; }
        if let Some(v) = self.started_at { job.started_at = v; }
        if let Some(v) = self.completed_at { job.completed_at = v; }
        if let Some(v) = self.next_retry_at { job.next_retry_at = v; }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// All jobs.
    pub total: usize,
    /// `pending` jobs.
    pub pending: usize,
    /// `running` jobs.
    pub running: usize,
    /// `completed` jobs.
    pub completed: usize,
    /// `failed` jobs.
    pub failed: usize,
    /// `cancelled` jobs.
    pub cancelled: usize,
}

impl JobStats {
    pub(crate) fn count(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}
