#![deny(missing_docs)]
//! jobq_core: shared building blocks (config, KV, logging, job model, retry manager).

/// Configuration helpers (AppId, dirs, load_or_init, etc.)
pub mod cfg;
/// Persistence errors.
pub mod error;
/// Handler contract and closure adapter.
pub mod handler;
/// Shared job model used by the manager, daemon and CLI.
pub mod job;
/// Tracing/log initialization helpers.
pub mod logx;
pub mod manager;
/// Retry delay table.
pub mod retry;
/// Simple file-backed KV store with serde helpers and the job repository.
pub mod store;

pub use error::{QueueError, QueueResult};
pub use handler::{handler_fn, JobContext, JobHandler};
pub use job::{CreateOptions, Job, JobFilter, JobLog, JobPatch, JobStats, JobStatus, LogLevel};
pub use manager::{Clock, JobManager, ProcessSummary, SystemClock};
pub use retry::RetryPolicy;
pub use store::{JobRepo, KvJobRepo};
