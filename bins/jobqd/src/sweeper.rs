use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::module::{Module, ModuleCtx};

/// Periodically removes terminal jobs past the retention window.
pub struct Sweeper {
    period: Duration,
    retention_days: u32,
}

impl Sweeper {
    pub fn new(period: Duration, retention_days: u32) -> Self {
        Self { period: period.max(Duration::from_millis(1)), retention_days }
    }
}

impl Module for Sweeper {
    fn name(&self) -> &'static str { "sweeper" }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut tick = interval(self.period);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match ctx.manager.cleanup_old_jobs(self.retention_days) {
                            Ok(0) => {}
                            Ok(n) => info!("sweeper removed {} jobs older than {}d", n, self.retention_days),
                            Err(e) => warn!("sweep failed err={}", e),
                        }
                    }
                    changed = ctx.shutdown.changed() => {
                        if changed.is_err() || *ctx.shutdown.borrow() {
                            info!("sweeper stopping");
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}
