use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use jobq_core::store::{ns, KvSerde};
use crate::module::{Module, ModuleCtx};

/// Runtime counters persisted across restarts.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SchedulerState {
    /// Completed passes.
    pub passes: u64,
    /// Timestamp (ms since epoch) of the last pass.
    pub last_pass_ms: u64,
    /// Jobs executed over all passes.
    pub executed_total: u64,
    /// Passes aborted by a store error.
    pub failed_passes: u64,
}

pub fn state_key() -> Vec<u8> {
    ns("scheduler", "state")
}

/// Drives `process_pending_jobs` on a fixed period, one pass at a time.
pub struct Scheduler {
    tick_ms: u64,
}

impl Scheduler {
    pub fn new(tick_ms: u64) -> Self {
        Self { tick_ms: tick_ms.max(1) }
    }
}

impl Module for Scheduler {
    fn name(&self) -> &'static str { "scheduler" }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut state: SchedulerState = ctx.kv.get_t(&state_key())?.unwrap_or_default();
            let mut tick = interval(Duration::from_millis(self.tick_ms));
            // A slow pass pushes the next one back instead of bunching them up.
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        state.passes = state.passes.saturating_add(1);
                        state.last_pass_ms = now_ms();
                        match ctx.manager.process_pending_jobs().await {
                            Ok(summary) => {
                                state.executed_total = state.executed_total.saturating_add(summary.executed as u64);
                                if summary.executed > 0 {
                                    info!("pass {} executed={} deferred={}", state.passes, summary.executed, summary.deferred);
                                } else {
                                    debug!("pass {} idle deferred={}", state.passes, summary.deferred);
                                }
                            }
                            Err(e) => {
                                state.failed_passes = state.failed_passes.saturating_add(1);
                                warn!("pass {} failed err={}", state.passes, e);
                            }
                        }
                        if let Err(e) = ctx.kv.put_t(&state_key(), &state) {
                            warn!("scheduler state not saved err={:#}", e);
                        }
                    }
                    changed = ctx.shutdown.changed() => {
                        if changed.is_err() || *ctx.shutdown.borrow() {
                            ctx.kv.put_t(&state_key(), &state)?;
                            info!("scheduler stopping after {} passes", state.passes);
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
