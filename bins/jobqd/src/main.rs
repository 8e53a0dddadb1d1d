use std::sync::Arc;

use anyhow::{Context, Result};
use jobq_core::cfg::{self, AppId, Config};
use jobq_core::store::{self, KvJobRepo};
use jobq_core::{logx, JobManager};
use tokio::time::Duration;
use tracing::{info, warn};

mod module;
mod runner;
mod scheduler;
mod sweeper;
mod web;

use module::{Module, ModuleCtx};

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"), // <- no literal; comes from crate name
};

fn main() -> Result<()> {
    let cfg = cfg::load_or_init(&APP).context("config")?;
    logx::init(&cfg.log_level);
    runtime()?.block_on(run(cfg))
}

#[cfg(feature = "rt-single")]
fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
}

#[cfg(not(feature = "rt-single"))]
fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(1, 4))
        .enable_all()
        .build()?)
}

async fn run(cfg: Config) -> Result<()> {
    info!("{} boot", APP.application);
    let dir = cfg::data_dir(&APP, &cfg)?;
    info!("store dir={}", dir.display());
    let kv = store::open_default(&dir)?;

    let manager = Arc::new(JobManager::new(KvJobRepo::new(kv.clone()), &cfg.queue));
    runner::register_builtins(&manager);
    info!("handlers: {}", manager.handler_types().join(","));

    let (tx, rx) = tokio::sync::watch::channel(false);
    let ctx = ModuleCtx { kv, manager, shutdown: rx };

    #[allow(unused_mut)]
    let mut modules: Vec<Box<dyn Module>> = vec![
        Box::new(scheduler::Scheduler::new(cfg.scheduler.tick_ms)),
        Box::new(sweeper::Sweeper::new(
            Duration::from_millis(cfg.scheduler.cleanup_every_ms),
            cfg.queue.retention_days,
        )),
    ];
    #[cfg(feature = "web-api")]
    if let Some(addr) = &cfg.web.http_addr {
        let addr = addr.parse().with_context(|| format!("web.http_addr {addr}"))?;
        modules.push(Box::new(web::WebServer::new(addr)));
    }
    #[cfg(not(feature = "web-api"))]
    if cfg.web.http_addr.is_some() {
        warn!("web.http_addr set but built without the web-api feature");
    }

    let handles: Vec<_> = modules
        .into_iter()
        .map(|m| {
            let name = m.name();
            info!("module {} starting", name);
            (name, m.spawn(ctx.clone()))
        })
        .collect();

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    let _ = tx.send(true);

    for (name, h) in handles {
        match h.await {
            Ok(Ok(())) => info!("module {} stopped", name),
            Ok(Err(e)) => warn!("module {} failed err={:#}", name, e),
            Err(e) => warn!("module {} panicked err={}", name, e),
        }
    }
    Ok(())
}
