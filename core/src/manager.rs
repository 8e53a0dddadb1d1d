//! The job queue and retry manager.
//!
//! Jobs are executed one at a time by whoever drives
//! [`JobManager::process_pending_jobs`]; the manager never schedules itself.
//! Bookkeeping is whole-list load/modify/save against a [`JobRepo`], so two
//! processes sharing one store race and the last writer wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cfg::QueueConfig;
use crate::error::QueueResult;
use crate::handler::{JobContext, JobHandler};
use crate::job::{CreateOptions, Job, JobFilter, JobLog, JobPatch, JobStats, JobStatus, LogLevel};
use crate::retry::RetryPolicy;
use crate::store::JobRepo;

/// Job id used for log entries that belong to no single job.
pub const SYSTEM_LOG_ID: &str = "system";

/// Source of "now" for due-times and retention.
pub trait Clock: Send + Sync + 'static {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Outcome of one [`JobManager::process_pending_jobs`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    /// Jobs handed to [`JobManager::execute_job`] and actually run.
    pub executed: usize,
    /// Pending jobs skipped because their retry is not yet due.
    pub deferred: usize,
}

enum Transition {
    Missing,
    Rejected(Job),
    Applied(Job),
}

/// What one call into the execution path did.
enum Attempt {
    /// Already executing in this process, or no longer stored.
    Skipped,
    /// Terminal before it could start; the handler never ran.
    Rejected(Job),
    /// Moved to `running` and finished; `None` if deleted mid-run.
    Ran(Option<Job>),
}

impl Attempt {
    fn into_job(self) -> Option<Job> {
        match self {
            Attempt::Skipped => None,
            Attempt::Rejected(j) => Some(j),
            Attempt::Ran(j) => j,
        }
    }
}

/// Longest wait a retry is ever scheduled for.
const MAX_RETRY_DELAY_DAYS: i64 = 36_500;

/// Due-time of the next retry. Oversized delays are capped instead of
/// overflowing the calendar.
fn retry_at(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    let cap = chrono::Duration::days(MAX_RETRY_DELAY_DAYS);
    let delay = chrono::Duration::from_std(delay).map_or(cap, |d| d.min(cap));
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Persists jobs, runs them against registered handlers and retries
/// failures along a [`RetryPolicy`].
pub struct JobManager<R: JobRepo> {
    repo: R,
    policy: RetryPolicy,
    default_max_retries: u32,
    log_capacity: usize,
    clock: Arc<dyn Clock>,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    // Ids currently inside `execute_job`, with the token handed to the handler.
    processing: Mutex<HashMap<String, CancellationToken>>,
    // Serializes load/modify/save within this process only.
    jobs_io: Mutex<()>,
    logs_io: Mutex<()>,
}

/// Releases the processing guard for one job on drop.
struct Claim<'a> {
    processing: &'a Mutex<HashMap<String, CancellationToken>>,
    id: String,
    cancel: CancellationToken,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        lock(self.processing).remove(&self.id);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<R: JobRepo> JobManager<R> {
    /// Manager over `repo` using the retry and log settings in `cfg`.
    pub fn new(repo: R, cfg: &QueueConfig) -> Self {
        Self {
            repo,
            policy: cfg.retry_policy(),
            default_max_retries: cfg.default_max_retries,
            log_capacity: cfg.log_capacity,
            clock: Arc::new(SystemClock),
            handlers: RwLock::new(HashMap::new()),
            processing: Mutex::new(HashMap::new()),
            jobs_io: Mutex::new(()),
            logs_io: Mutex::new(()),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The retry delay table in use.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The backing repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /* --------------------- handlers --------------------- */

    /// Bind `handler` to `job_type`, replacing any previous binding.
    pub fn register_handler(&self, job_type: impl Into<String>, handler: impl JobHandler) {
        let job_type = job_type.into();
        debug!("handler registered type={}", job_type);
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_type, Arc::new(handler));
    }

    /// Whether a handler is bound to `job_type`.
    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn handler_types(&self) -> Vec<String> {
        let mut types: Vec<String> =
            self.handlers.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        types.sort();
        types
    }

    fn handler_for(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).get(job_type).cloned()
    }

    /* --------------------- CRUD --------------------- */

    /// Persist a new `pending` job.
    pub fn create_job(&self, job_type: impl Into<String>, payload: Value, opts: CreateOptions) -> QueueResult<Job> {
        let max_retries = opts.max_retries.unwrap_or(self.default_max_retries);
        let job = Job::new(job_type, payload, max_retries, self.clock.now());
        {
            let _io = lock(&self.jobs_io);
            let mut jobs = self.repo.load_jobs()?;
            jobs.push(job.clone());
            self.repo.save_jobs(&jobs)?;
        }
        // Already enqueued: a lost log entry is not a create failure.
        if let Err(e) = self.add_log(&job.id, LogLevel::Info, "Job created", Some(json!({ "type": job.job_type, "max_retries": max_retries }))) {
            warn!("job created but log not written id={} err={}", job.id, e);
        }
        Ok(job)
    }

    /// Jobs matching `filter`, newest first.
    pub fn get_jobs(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self.repo.load_jobs()?.into_iter().filter(|j| filter.matches(j)).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    /// Look up one job.
    pub fn get_job(&self, id: &str) -> QueueResult<Option<Job>> {
        Ok(self.repo.load_jobs()?.into_iter().find(|j| j.id == id))
    }

    /// Shallow-merge `patch` into the stored job. No concurrency check.
    pub fn update_job(&self, id: &str, patch: JobPatch) -> QueueResult<Option<Job>> {
        match self.transition(id, |j| {
            patch.apply(j);
            true
        })? {
            Transition::Applied(j) => Ok(Some(j)),
            Transition::Missing | Transition::Rejected(_) => Ok(None),
        }
    }

    /// Load, let `f` mutate one job, and save if `f` reports a change.
    fn transition<F>(&self, id: &str, f: F) -> QueueResult<Transition>
    where
        F: FnOnce(&mut Job) -> bool,
    {
        let _io = lock(&self.jobs_io);
        let mut jobs = self.repo.load_jobs()?;
        let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(Transition::Missing);
        };
        if !f(job) {
            return Ok(Transition::Rejected(job.clone()));
        }
        let updated = job.clone();
        self.repo.save_jobs(&jobs)?;
        Ok(Transition::Applied(updated))
    }

    /* --------------------- execution --------------------- */

    fn claim(&self, id: &str) -> Option<Claim<'_>> {
        let mut processing = lock(&self.processing);
        if processing.contains_key(id) {
            return None;
        }
        let cancel = CancellationToken::new();
        processing.insert(id.to_string(), cancel.clone());
        Some(Claim { processing: &self.processing, id: id.to_string(), cancel })
    }

    /// Run one attempt of `job` and record the outcome.
    ///
    /// Returns `None` when the job is already executing in this process or no
    /// longer exists; otherwise the job as persisted afterwards. Handler
    /// errors and panics are captured on the job, never returned.
    pub async fn execute_job(&self, job: &Job) -> QueueResult<Option<Job>> {
        Ok(self.attempt(job).await?.into_job())
    }

    async fn attempt(&self, job: &Job) -> QueueResult<Attempt> {
        let Some(claim) = self.claim(&job.id) else {
            warn!("job already processing id={}", job.id);
            self.add_log(&job.id, LogLevel::Warn, "Job is already being processed", None)?;
            return Ok(Attempt::Skipped);
        };

        let now = self.clock.now();
        let running = match self.transition(&job.id, |j| {
            if j.status.is_terminal() {
                return false;
            }
            j.status = JobStatus::Running;
            j.started_at.get_or_insert(now);
            true
        })? {
            Transition::Missing => {
                warn!("job vanished before execution id={}", job.id);
                return Ok(Attempt::Skipped);
            }
            Transition::Rejected(j) => {
                warn!("job not executed id={} status={}", j.id, j.status);
                self.add_log(&j.id, LogLevel::Warn, &format!("Job is {}; not executing", j.status), None)?;
                return Ok(Attempt::Rejected(j));
            }
            Transition::Applied(j) => j,
        };
        info!("job started id={} type={} attempt={}", running.id, running.job_type, running.retry_count);
        self.add_log(&running.id, LogLevel::Info, "Job started", Some(json!({ "attempt": running.retry_count })))?;

        let Some(handler) = self.handler_for(&running.job_type) else {
            let msg = format!("No handler registered for job type: {}", running.job_type);
            error!("job failed id={} err={}", running.id, msg);
            let failed = self.finish_unhandled(&running.id, msg.clone())?;
            self.add_log(&running.id, LogLevel::Error, &msg, None)?;
            return Ok(Attempt::Ran(failed));
        };

        let ctx = JobContext { attempt: running.retry_count, cancel: claim.cancel.clone() };
        let outcome = run_handler(handler, running.clone(), ctx).await;
        let written = self.record_outcome(&running.id, outcome)?;
        drop(claim);
        Ok(Attempt::Ran(written))
    }

    fn finish_unhandled(&self, id: &str, msg: String) -> QueueResult<Option<Job>> {
        let now = self.clock.now();
        Ok(match self.transition(id, |j| {
            if j.status != JobStatus::Running {
                return false;
            }
            j.status = JobStatus::Failed;
            j.error = Some(msg);
            j.completed_at = Some(now);
            j.next_retry_at = None;
            true
        })? {
            Transition::Missing => None,
            Transition::Rejected(j) | Transition::Applied(j) => Some(j),
        })
    }

    fn record_outcome(&self, id: &str, outcome: Result<Value, String>) -> QueueResult<Option<Job>> {
        let now = self.clock.now();
        let policy = &self.policy;
        let failure = outcome.as_ref().err().cloned();

        let transition = self.transition(id, |j| {
            // Cancelled (or otherwise moved on) while the handler ran: stale.
            if j.status != JobStatus::Running {
                return false;
            }
            match outcome {
                Ok(result) => {
                    j.status = JobStatus::Completed;
                    j.result = Some(result);
                    j.completed_at = Some(now);
                    j.next_retry_at = None;
                }
                Err(msg) => {
                    j.error = Some(msg);
                    if j.retry_count < j.max_retries {
                        j.next_retry_at = Some(retry_at(now, policy.delay(j.retry_count)));
                        j.retry_count += 1;
                        j.status = JobStatus::Pending;
                    } else {
                        j.status = JobStatus::Failed;
                        j.completed_at = Some(now);
                        j.next_retry_at = None;
                    }
                }
            }
            true
        })?;

        let job = match transition {
            Transition::Missing => {
                warn!("job deleted while running id={}", id);
                return Ok(None);
            }
            Transition::Rejected(j) => {
                warn!("discarding stale handler outcome id={} status={}", j.id, j.status);
                self.add_log(&j.id, LogLevel::Warn, &format!("Handler finished after job was {}; outcome discarded", j.status), None)?;
                return Ok(Some(j));
            }
            Transition::Applied(j) => j,
        };

        match (job.status, failure) {
            (JobStatus::Completed, _) => {
                info!("job ok id={}", job.id);
                self.add_log(&job.id, LogLevel::Info, "Job completed", None)?;
            }
            (JobStatus::Pending, Some(err)) => {
                let next = job.next_retry_at.map(|t| t.to_rfc3339());
                info!("job retry scheduled id={} retry={}/{} err={}", job.id, job.retry_count, job.max_retries, err);
                self.add_log(
                    &job.id,
                    LogLevel::Info,
                    &format!("Job failed, retry {}/{} scheduled", job.retry_count, job.max_retries),
                    Some(json!({ "error": err, "next_retry_at": next })),
                )?;
            }
            (_, err) => {
                error!("job failed id={} retries={} err={:?}", job.id, job.retry_count, err);
                self.add_log(&job.id, LogLevel::Error, "Job failed", Some(json!({ "error": err, "retry_count": job.retry_count })))?;
            }
        }
        Ok(Some(job))
    }

    /// Execute every due `pending` job once, sequentially, newest first.
    pub async fn process_pending_jobs(&self) -> QueueResult<ProcessSummary> {
        let pending = self.get_jobs(&JobFilter::status(JobStatus::Pending))?;
        let now = self.clock.now();
        let mut summary = ProcessSummary::default();
        for job in pending {
            if !job.is_due(now) {
                summary.deferred += 1;
                continue;
            }
            if let Attempt::Ran(_) = self.attempt(&job).await? {
                summary.executed += 1;
            }
        }
        if summary.executed > 0 || summary.deferred > 0 {
            debug!("pending pass executed={} deferred={}", summary.executed, summary.deferred);
        }
        Ok(summary)
    }

    /* --------------------- cancellation & removal --------------------- */

    /// Cancel a `pending` or `running` job. Returns `false` if the job is
    /// missing or already terminal. A running handler is signalled through its
    /// [`JobContext::cancel`] token but keeps running.
    pub fn cancel_job(&self, id: &str) -> QueueResult<bool> {
        let now = self.clock.now();
        let cancelled = match self.transition(id, |j| {
            if j.status.is_terminal() {
                return false;
            }
            j.status = JobStatus::Cancelled;
            j.completed_at = Some(now);
            j.next_retry_at = None;
            true
        })? {
            Transition::Applied(_) => true,
            Transition::Missing | Transition::Rejected(_) => false,
        };
        if cancelled {
            if let Some(token) = lock(&self.processing).get(id) {
                token.cancel();
            }
            info!("job cancelled id={}", id);
            self.add_log(id, LogLevel::Info, "Job cancelled", None)?;
        }
        Ok(cancelled)
    }

    /// Remove a job regardless of status. Its log entries are kept.
    pub fn delete_job(&self, id: &str) -> QueueResult<bool> {
        let _io = lock(&self.jobs_io);
        let mut jobs = self.repo.load_jobs()?;
        let Some(pos) = jobs.iter().position(|j| j.id == id) else {
            return Ok(false);
        };
        jobs.remove(pos);
        self.repo.save_jobs(&jobs)?;
        info!("job deleted id={}", id);
        Ok(true)
    }

    /// Drop terminal jobs that finished more than `days_to_keep` days ago.
    pub fn cleanup_old_jobs(&self, days_to_keep: u32) -> QueueResult<usize> {
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(chrono::Duration::days(i64::from(days_to_keep)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = {
            let _io = lock(&self.jobs_io);
            let mut jobs = self.repo.load_jobs()?;
            let before = jobs.len();
            jobs.retain(|j| !(j.status.is_terminal() && j.finished_at() < cutoff));
            let removed = before - jobs.len();
            if removed > 0 {
                self.repo.save_jobs(&jobs)?;
            }
            removed
        };
        info!("cleanup removed={} days_to_keep={}", removed, days_to_keep);
        self.add_log(
            SYSTEM_LOG_ID,
            LogLevel::Info,
            &format!("Cleaned up {removed} old jobs"),
            Some(json!({ "removed": removed, "days_to_keep": days_to_keep })),
        )?;
        Ok(removed)
    }

    /* --------------------- logs & stats --------------------- */

    /// Append a log entry, keeping only the newest `log_capacity` entries.
    pub fn add_log(&self, job_id: &str, level: LogLevel, message: &str, data: Option<Value>) -> QueueResult<()> {
        debug!(job_id, level = ?level, "job log: {}", message);
        let entry = JobLog {
            job_id: job_id.to_string(),
            timestamp: self.clock.now(),
            level,
            message: message.to_string(),
            data,
        };
        let _io = lock(&self.logs_io);
        let mut logs = self.repo.load_logs()?;
        logs.push(entry);
        if logs.len() > self.log_capacity {
            let excess = logs.len() - self.log_capacity;
            logs.drain(..excess);
        }
        self.repo.save_logs(&logs)
    }

    /// Log entries for `job_id`, oldest first.
    pub fn get_logs(&self, job_id: &str) -> QueueResult<Vec<JobLog>> {
        Ok(self.repo.load_logs()?.into_iter().filter(|l| l.job_id == job_id).collect())
    }

    /// Job counts per status.
    pub fn stats(&self) -> QueueResult<JobStats> {
        let mut stats = JobStats::default();
        for job in self.repo.load_jobs()? {
            stats.count(job.status);
        }
        Ok(stats)
    }

    /// Ids currently executing in this process.
    pub fn processing_ids(&self) -> Vec<String> {
        lock(&self.processing).keys().cloned().collect()
    }
}

/// Run the handler on its own task so a panic is contained and reported.
async fn run_handler(handler: Arc<dyn JobHandler>, job: Job, ctx: JobContext) -> Result<Value, String> {
    match tokio::spawn(async move { handler.handle(job, ctx).await }).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(join) if join.is_panic() => {
            let panic = join.into_panic();
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("handler panicked: {msg}"))
        }
        Err(_) => Err("handler task was aborted".to_string()),
    }
}
