use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use jobq_core::cfg::QueueConfig;
use jobq_core::store::MemKv;
use jobq_core::{
    handler_fn, Clock, CreateOptions, Job, JobContext, JobFilter, JobManager, JobPatch, JobStatus, KvJobRepo,
    JobRepo, LogLevel, QueueError, QueueResult,
};
use serde_json::{json, Value};
use tokio::sync::Notify;

struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    fn at(t: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(t)))
    }
    fn advance(&self, d: chrono::Duration) {
        let mut t = self.0.lock().unwrap();
        *t = *t + d;
    }
    fn set(&self, t: DateTime<Utc>) {
        *self.0.lock().unwrap() = t;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
}

type Mgr = JobManager<KvJobRepo<MemKv>>;

fn manager(clock: Arc<ManualClock>) -> Mgr {
    JobManager::new(KvJobRepo::new(MemKv::new()), &QueueConfig::default()).with_clock(clock)
}

async fn explode(_job: Job, _ctx: JobContext) -> anyhow::Result<Value> {
    panic!("kaboom")
}

fn retries(n: u32) -> CreateOptions {
    CreateOptions { max_retries: Some(n) }
}

#[tokio::test]
async fn create_job_starts_pending_with_a_log_entry() {
    let mgr = manager(ManualClock::at(t0()));
    let job = mgr.create_job("echo", json!({"msg": "hi"}), CreateOptions::default()).unwrap();

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.max_retries, 3);
    assert_eq!(job.created_at, t0());
    assert_eq!(mgr.get_job(&job.id).unwrap(), Some(job.clone()));

    let logs = mgr.get_logs(&job.id).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, LogLevel::Info);
    assert_eq!(logs[0].message, "Job created");
}

#[tokio::test]
async fn always_failing_handler_exhausts_retries() {
    let mgr = manager(ManualClock::at(t0()));
    mgr.register_handler("echo", handler_fn(|_job, _ctx| async { Err::<Value, _>(anyhow!("boom")) }));
    let job = mgr.create_job("echo", json!({"msg": "hi"}), retries(2)).unwrap();

    let first = mgr.execute_job(&job).await.unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Pending);
    assert_eq!(first.retry_count, 1);
    assert_eq!(first.error.as_deref(), Some("boom"));

    mgr.execute_job(&job).await.unwrap();
    let last = mgr.execute_job(&job).await.unwrap().unwrap();

    assert_eq!(last.status, JobStatus::Failed);
    assert_eq!(last.retry_count, 2);
    assert_eq!(last.error.as_deref(), Some("boom"));
    assert!(last.completed_at.is_some());
    assert!(last.next_retry_at.is_none());
}

#[tokio::test]
async fn n_failures_fail_with_retry_count_n() {
    for n in 0..4 {
        let mgr = manager(ManualClock::at(t0()));
        mgr.register_handler("flaky", handler_fn(|_job, _ctx| async { Err::<Value, _>(anyhow!("nope")) }));
        let job = mgr.create_job("flaky", json!(null), retries(n)).unwrap();
        for _ in 0..=n {
            mgr.execute_job(&job).await.unwrap();
        }
        let done = mgr.get_job(&job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed, "max_retries={n}");
        assert_eq!(done.retry_count, n);

        // Terminal: a further execution changes nothing.
        let again = mgr.execute_job(&job).await.unwrap().unwrap();
        assert_eq!(again, done);
    }
}

#[tokio::test]
async fn succeeds_on_second_attempt() {
    let mgr = manager(ManualClock::at(t0()));
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    mgr.register_handler(
        "echo",
        handler_fn(move |job, _ctx| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(anyhow!("first try fails"));
                }
                Ok(json!({ "echoed": job.payload["msg"] }))
            }
        }),
    );
    let job = mgr.create_job("echo", json!({"msg": "hi"}), retries(2)).unwrap();

    mgr.execute_job(&job).await.unwrap();
    let done = mgr.execute_job(&job).await.unwrap().unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count, 1);
    assert_eq!(done.result.as_ref().unwrap()["echoed"], "hi");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn attempt_number_is_passed_to_handler() {
    let mgr = manager(ManualClock::at(t0()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    mgr.register_handler(
        "count",
        handler_fn(move |_job, ctx| {
            let s = s.clone();
            async move {
                s.lock().unwrap().push(ctx.attempt);
                if ctx.attempt < 2 { Err(anyhow!("again")) } else { Ok(json!(ctx.attempt)) }
            }
        }),
    );
    let job = mgr.create_job("count", json!(null), retries(3)).unwrap();
    for _ in 0..3 {
        mgr.execute_job(&job).await.unwrap();
    }
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(mgr.get_job(&job.id).unwrap().unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn missing_handler_fails_without_retry() {
    let mgr = manager(ManualClock::at(t0()));
    let job = mgr.create_job("unknown", json!({}), retries(5)).unwrap();

    let done = mgr.execute_job(&job).await.unwrap().unwrap();

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.retry_count, 0);
    assert!(done.error.unwrap().contains("unknown"));
    assert!(mgr.processing_ids().is_empty());
    let logs = mgr.get_logs(&job.id).unwrap();
    assert_eq!(logs.last().unwrap().level, LogLevel::Error);
}

#[tokio::test]
async fn panicking_handler_counts_as_failure() {
    let mgr = manager(ManualClock::at(t0()));
    mgr.register_handler("boom", handler_fn(explode));
    let job = mgr.create_job("boom", json!(null), retries(1)).unwrap();

    let after = mgr.execute_job(&job).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Pending);
    assert_eq!(after.retry_count, 1);
    assert_eq!(after.error.as_deref(), Some("handler panicked: kaboom"));
    assert!(mgr.processing_ids().is_empty());
}

#[tokio::test]
async fn retry_delay_follows_the_table() {
    let clock = ManualClock::at(t0());
    let mgr = manager(clock.clone());
    mgr.register_handler("fail", handler_fn(|_job, _ctx| async { Err::<Value, _>(anyhow!("x")) }));
    let job = mgr.create_job("fail", json!(null), retries(10)).unwrap();

    let expected_minutes = [1, 5, 15, 30, 60, 60];
    for mins in expected_minutes {
        let now = clock.now();
        let after = mgr.execute_job(&job).await.unwrap().unwrap();
        assert_eq!(after.next_retry_at, Some(now + chrono::Duration::minutes(mins)));
        clock.advance(chrono::Duration::minutes(mins));
    }
}

#[tokio::test]
async fn process_pending_defers_jobs_not_yet_due() {
    let clock = ManualClock::at(t0());
    let mgr = manager(clock.clone());
    mgr.register_handler("fail", handler_fn(|_job, _ctx| async { Err::<Value, _>(anyhow!("x")) }));
    let job = mgr.create_job("fail", json!(null), retries(3)).unwrap();

    let s = mgr.process_pending_jobs().await.unwrap();
    assert_eq!((s.executed, s.deferred), (1, 0));

    clock.advance(chrono::Duration::seconds(30));
    let s = mgr.process_pending_jobs().await.unwrap();
    assert_eq!((s.executed, s.deferred), (0, 1));
    assert_eq!(mgr.get_job(&job.id).unwrap().unwrap().retry_count, 1);

    clock.advance(chrono::Duration::seconds(30));
    let s = mgr.process_pending_jobs().await.unwrap();
    assert_eq!((s.executed, s.deferred), (1, 0));
    assert_eq!(mgr.get_job(&job.id).unwrap().unwrap().retry_count, 2);
}

#[tokio::test]
async fn process_pending_runs_newest_first() {
    let clock = ManualClock::at(t0());
    let mgr = manager(clock.clone());
    let order = Arc::new(Mutex::new(Vec::new()));
    let o = order.clone();
    mgr.register_handler(
        "rec",
        handler_fn(move |job, _ctx| {
            let o = o.clone();
            async move {
                o.lock().unwrap().push(job.payload["n"].as_u64().unwrap_or_default());
                anyhow::Ok(json!(null))
            }
        }),
    );
    for n in 0..3 {
        mgr.create_job("rec", json!({ "n": n }), CreateOptions::default()).unwrap();
        clock.advance(chrono::Duration::seconds(1));
    }
    let s = mgr.process_pending_jobs().await.unwrap();
    assert_eq!(s.executed, 3);
    assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    assert_eq!(mgr.stats().unwrap().completed, 3);
}

#[tokio::test]
async fn get_jobs_filters_sorts_and_limits() {
    let clock = ManualClock::at(t0());
    let mgr = manager(clock.clone());
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(mgr.create_job("echo", json!(null), CreateOptions::default()).unwrap().id);
        clock.advance(chrono::Duration::seconds(1));
    }
    mgr.create_job("other", json!(null), CreateOptions::default()).unwrap();
    mgr.cancel_job(&ids[0]).unwrap();

    let newest = mgr.get_jobs(&JobFilter::status(JobStatus::Pending).with_limit(1)).unwrap();
    assert_eq!(newest.len(), 1);
    assert_eq!(newest[0].job_type, "other");

    let echo = mgr.get_jobs(&JobFilter::status(JobStatus::Pending).with_type("echo").with_limit(1)).unwrap();
    assert_eq!(echo[0].id, ids[4]);

    let all = mgr.get_jobs(&JobFilter::default()).unwrap();
    assert_eq!(all.len(), 6);
    assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));

    let cancelled = mgr.get_jobs(&JobFilter::status(JobStatus::Cancelled)).unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, ids[0]);
}

#[tokio::test]
async fn cancel_pending_and_refuse_terminal() {
    let clock = ManualClock::at(t0());
    let mgr = manager(clock.clone());
    mgr.register_handler("ok", handler_fn(|_job, _ctx| async { anyhow::Ok(json!(1)) }));

    let pending = mgr.create_job("ok", json!(null), CreateOptions::default()).unwrap();
    assert!(mgr.cancel_job(&pending.id).unwrap());
    let cancelled = mgr.get_job(&pending.id).unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.completed_at, Some(t0()));

    clock.advance(chrono::Duration::hours(1));
    assert!(!mgr.cancel_job(&pending.id).unwrap());
    assert_eq!(mgr.get_job(&pending.id).unwrap().unwrap().completed_at, Some(t0()));

    let done = mgr.create_job("ok", json!(null), CreateOptions::default()).unwrap();
    let done = mgr.execute_job(&done).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(!mgr.cancel_job(&done.id).unwrap());
    assert_eq!(mgr.get_job(&done.id).unwrap().unwrap().completed_at, done.completed_at);

    let failed = mgr.create_job("none", json!(null), CreateOptions::default()).unwrap();
    let failed = mgr.execute_job(&failed).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(!mgr.cancel_job(&failed.id).unwrap());

    assert!(!mgr.cancel_job("no-such-id").unwrap());
}

#[tokio::test]
async fn cancelling_a_running_job_signals_and_discards_late_result() {
    let mgr = Arc::new(manager(ManualClock::at(t0())));
    let started = Arc::new(Notify::new());
    let st = started.clone();
    mgr.register_handler(
        "slow",
        handler_fn(move |_job, ctx| {
            let st = st.clone();
            async move {
                st.notify_one();
                ctx.cancel.cancelled().await;
                anyhow::Ok(json!("late"))
            }
        }),
    );
    let job = mgr.create_job("slow", json!(null), CreateOptions::default()).unwrap();

    let m = mgr.clone();
    let j = job.clone();
    let run = tokio::spawn(async move { m.execute_job(&j).await });
    started.notified().await;

    assert_eq!(mgr.get_job(&job.id).unwrap().unwrap().status, JobStatus::Running);
    assert!(mgr.cancel_job(&job.id).unwrap());

    let after = run.await.unwrap().unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Cancelled);
    assert!(after.result.is_none());
    let logs = mgr.get_logs(&job.id).unwrap();
    assert!(logs.iter().any(|l| l.message.contains("outcome discarded")));
    assert!(mgr.processing_ids().is_empty());
}

#[tokio::test]
async fn processing_guard_blocks_reentry() {
    let mgr = Arc::new(manager(ManualClock::at(t0())));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (st, rl) = (started.clone(), release.clone());
    mgr.register_handler(
        "hold",
        handler_fn(move |_job, _ctx| {
            let (st, rl) = (st.clone(), rl.clone());
            async move {
                st.notify_one();
                rl.notified().await;
                anyhow::Ok(json!("done"))
            }
        }),
    );
    let job = mgr.create_job("hold", json!(null), CreateOptions::default()).unwrap();

    let m = mgr.clone();
    let j = job.clone();
    let run = tokio::spawn(async move { m.execute_job(&j).await });
    started.notified().await;

    assert_eq!(mgr.processing_ids(), vec![job.id.clone()]);
    assert!(mgr.execute_job(&job).await.unwrap().is_none());

    release.notify_one();
    let done = run.await.unwrap().unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(mgr.processing_ids().is_empty());
    let warns = mgr.get_logs(&job.id).unwrap().into_iter().filter(|l| l.level == LogLevel::Warn).count();
    assert_eq!(warns, 1);
}

#[tokio::test]
async fn delete_removes_regardless_of_status() {
    let mgr = manager(ManualClock::at(t0()));
    let a = mgr.create_job("x", json!(null), CreateOptions::default()).unwrap();
    let b = mgr.create_job("x", json!(null), CreateOptions::default()).unwrap();
    mgr.cancel_job(&b.id).unwrap();

    assert!(mgr.delete_job(&a.id).unwrap());
    assert!(mgr.delete_job(&b.id).unwrap());
    assert!(!mgr.delete_job(&a.id).unwrap());
    assert!(mgr.get_job(&a.id).unwrap().is_none());
    assert_eq!(mgr.stats().unwrap().total, 0);
}

#[tokio::test]
async fn cleanup_keeps_recent_and_non_terminal_jobs() {
    let clock = ManualClock::at(t0());
    let mgr = manager(clock.clone());
    mgr.register_handler("ok", handler_fn(|_job, _ctx| async { anyhow::Ok(json!(null)) }));

    let old_pending = mgr.create_job("ok", json!(null), CreateOptions::default()).unwrap();
    let old = mgr.create_job("ok", json!(null), CreateOptions::default()).unwrap();
    mgr.execute_job(&old).await.unwrap();
    let recent = mgr.create_job("ok", json!(null), CreateOptions::default()).unwrap();
    clock.advance(chrono::Duration::days(2));
    mgr.execute_job(&recent).await.unwrap();

    // old completed at t0, recent at t0+2d; now t0+8d.
    clock.set(t0() + chrono::Duration::days(8));
    let removed = mgr.cleanup_old_jobs(7).unwrap();

    assert_eq!(removed, 1);
    assert!(mgr.get_job(&old.id).unwrap().is_none());
    assert!(mgr.get_job(&recent.id).unwrap().is_some());
    assert!(mgr.get_job(&old_pending.id).unwrap().is_some());

    clock.set(t0() + chrono::Duration::days(365));
    mgr.cleanup_old_jobs(7).unwrap();
    assert!(mgr.get_job(&old_pending.id).unwrap().is_some());
    assert!(mgr.get_job(&recent.id).unwrap().is_none());
}

#[tokio::test]
async fn cleanup_uses_created_at_when_completed_at_is_missing() {
    let clock = ManualClock::at(t0());
    let mgr = manager(clock.clone());
    let job = mgr.create_job("x", json!(null), CreateOptions::default()).unwrap();
    mgr.update_job(&job.id, JobPatch { status: Some(JobStatus::Failed), ..Default::default() }).unwrap();

    clock.set(t0() + chrono::Duration::days(6));
    assert_eq!(mgr.cleanup_old_jobs(7).unwrap(), 0);
    clock.set(t0() + chrono::Duration::days(8));
    assert_eq!(mgr.cleanup_old_jobs(7).unwrap(), 1);
}

#[tokio::test]
async fn update_job_merges_fields() {
    let mgr = manager(ManualClock::at(t0()));
    let job = mgr.create_job("x", json!({"a": 1}), CreateOptions::default()).unwrap();

    let updated = mgr
        .update_job(&job.id, JobPatch { payload: Some(json!({"a": 2})), max_retries: Some(9), ..Default::default() })
        .unwrap()
        .unwrap();
    assert_eq!(updated.payload, json!({"a": 2}));
    assert_eq!(updated.max_retries, 9);
    assert_eq!(updated.status, JobStatus::Pending);
    assert!(mgr.update_job("missing", JobPatch::default()).unwrap().is_none());
}

#[tokio::test]
async fn logs_are_per_job_ordered_and_capped() {
    let cfg = QueueConfig { log_capacity: 5, ..QueueConfig::default() };
    let mgr = JobManager::new(KvJobRepo::new(MemKv::new()), &cfg).with_clock(ManualClock::at(t0()));

    for i in 0..4 {
        mgr.add_log("a", LogLevel::Debug, &format!("a{i}"), None).unwrap();
        mgr.add_log("b", LogLevel::Info, &format!("b{i}"), Some(json!({ "i": i }))).unwrap();
    }

    let a: Vec<String> = mgr.get_logs("a").unwrap().into_iter().map(|l| l.message).collect();
    let b: Vec<String> = mgr.get_logs("b").unwrap().into_iter().map(|l| l.message).collect();
    assert_eq!(a, vec!["a2", "a3"]);
    assert_eq!(b, vec!["b1", "b2", "b3"]);
    assert!(mgr.get_logs("c").unwrap().is_empty());
}

#[tokio::test]
async fn reregistering_a_type_replaces_the_handler() {
    let mgr = manager(ManualClock::at(t0()));
    mgr.register_handler("v", handler_fn(|_job, _ctx| async { anyhow::Ok(json!(1)) }));
    mgr.register_handler("v", handler_fn(|_job, _ctx| async { anyhow::Ok(json!(2)) }));
    assert_eq!(mgr.handler_types(), vec!["v".to_string()]);

    let job = mgr.create_job("v", json!(null), CreateOptions::default()).unwrap();
    let done = mgr.execute_job(&job).await.unwrap().unwrap();
    assert_eq!(done.result, Some(json!(2)));
}

#[tokio::test]
async fn state_survives_a_new_manager_on_the_same_store() {
    let dir = tempfile::tempdir().unwrap();
    let kv = jobq_core::store::open_default(dir.path()).unwrap();
    let first = JobManager::new(KvJobRepo::new(kv.clone()), &QueueConfig::default());
    let job = first.create_job("echo", json!({"msg": "hi"}), retries(2)).unwrap();

    let second = JobManager::new(KvJobRepo::new(kv), &QueueConfig::default());
    second.register_handler("echo", handler_fn(|job, _ctx| async move { anyhow::Ok(json!({ "echoed": job.payload["msg"] })) }));
    let s = second.process_pending_jobs().await.unwrap();

    assert_eq!(s.executed, 1);
    let done = first.get_job(&job.id).unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result.unwrap()["echoed"], "hi");
}

#[tokio::test]
async fn oversized_retry_delay_schedules_far_future_instead_of_panicking() {
    let cfg = QueueConfig { retry_delays_secs: vec![9_000_000_000_000], ..QueueConfig::default() };
    let mgr = JobManager::new(KvJobRepo::new(MemKv::new()), &cfg).with_clock(ManualClock::at(t0()));
    mgr.register_handler("fail", handler_fn(|_job, _ctx| async { Err::<Value, _>(anyhow!("nope")) }));
    let job = mgr.create_job("fail", json!(null), retries(1)).unwrap();

    let after = mgr.execute_job(&job).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Pending);
    let next = after.next_retry_at.unwrap();
    assert!(next > t0() + chrono::Duration::days(365 * 50));

    // Still stored and readable, and not due.
    assert_eq!(mgr.get_job(&job.id).unwrap(), Some(after));
    let s = mgr.process_pending_jobs().await.unwrap();
    assert_eq!((s.executed, s.deferred), (0, 1));
}

/// Jobs persist normally; every log write fails.
struct BrokenLogs(KvJobRepo<MemKv>);

impl JobRepo for BrokenLogs {
    fn load_jobs(&self) -> QueueResult<Vec<Job>> {
        self.0.load_jobs()
    }
    fn save_jobs(&self, jobs: &[Job]) -> QueueResult<()> {
        self.0.save_jobs(jobs)
    }
    fn load_logs(&self) -> QueueResult<Vec<jobq_core::JobLog>> {
        self.0.load_logs()
    }
    fn save_logs(&self, _logs: &[jobq_core::JobLog]) -> QueueResult<()> {
        Err(QueueError::Store {
            key: "jobs:logs".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        })
    }
}

#[tokio::test]
async fn create_job_succeeds_when_its_log_entry_cannot_be_written() {
    let mgr = JobManager::new(BrokenLogs(KvJobRepo::new(MemKv::new())), &QueueConfig::default());
    let job = mgr.create_job("echo", json!({"msg": "hi"}), CreateOptions::default()).unwrap();
    assert!(mgr.get_logs(&job.id).unwrap().is_empty());
    assert_eq!(mgr.get_job(&job.id).unwrap(), Some(job));
}
