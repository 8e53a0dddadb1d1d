use std::sync::Arc;

use jobq_core::store::{DefaultKv, KvJobRepo};
use jobq_core::JobManager;
use tokio::task::JoinHandle;

/// The manager as wired by the daemon: file-backed KV underneath.
pub type Manager = JobManager<KvJobRepo<DefaultKv>>;

#[derive(Clone)]
pub struct ModuleCtx {
    pub kv: DefaultKv,
    pub manager: Arc<Manager>,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}
