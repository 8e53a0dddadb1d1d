use std::time::Duration;

/// Retry delay table, indexed by how many retries a job has already consumed.
///
/// Counts past the end of the table reuse the last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    /// Build a policy from an explicit table.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Delay before the next attempt of a job with `retry_count` retries so far.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let idx = (retry_count as usize).min(self.delays.len().saturating_sub(1));
        self.delays.get(idx).copied().unwrap_or(Duration::ZERO)
    }

    /// The underlying table.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for RetryPolicy {
    /// 1m, 5m, 15m, 30m, 1h.
    fn default() -> Self {
        Self::new(
            [60, 5 * 60, 15 * 60, 30 * 60, 60 * 60]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        )
    }
}
