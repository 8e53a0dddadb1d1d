use thiserror::Error;

/// Failures of the queue's persistence layer.
///
/// Handler failures never show up here; they are recorded on the job.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Reading or writing the backing store failed.
    #[error("store i/o on {key}: {source}")]
    Store {
        /// Store key being accessed.
        key: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A stored record could not be encoded or decoded.
    #[error("codec on {key}: {source}")]
    Codec {
        /// Store key being accessed.
        key: String,
        /// Underlying serde_json error.
        #[source]
        source: serde_json::Error,
    },
}

/// Result alias used throughout the queue.
pub type QueueResult<T> = Result<T, QueueError>;
