//! Built-in job handlers registered by the daemon.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use jobq_core::{Job, JobContext, JobHandler};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::module::Manager;

/// Register every built-in handler on `manager`.
pub fn register_builtins(manager: &Manager) {
    manager.register_handler("noop", Noop);
    manager.register_handler("echo", Echo);
    manager.register_handler("exec", Exec);
    #[cfg(feature = "runner-http")]
    manager.register_handler("http", Http::new());
}

/// Succeeds with `null`.
pub struct Noop;

#[async_trait]
impl JobHandler for Noop {
    async fn handle(&self, _job: Job, _ctx: JobContext) -> Result<Value> {
        Ok(Value::Null)
    }
}

/// Returns `{"echoed": payload.msg}` (or the whole payload if there is no `msg`).
pub struct Echo;

#[async_trait]
impl JobHandler for Echo {
    async fn handle(&self, job: Job, _ctx: JobContext) -> Result<Value> {
        let echoed = job.payload.get("msg").cloned().unwrap_or(job.payload);
        Ok(json!({ "echoed": echoed }))
    }
}

/// Payload of an `exec` job.
#[derive(Deserialize)]
pub struct ExecSpec {
    /// Command/executable.
    pub cmd: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Optional timeout (ms).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Runs an OS command; non-zero exit fails the attempt. The child is killed
/// if the job is cancelled or the timeout elapses.
pub struct Exec;

#[async_trait]
impl JobHandler for Exec {
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<Value> {
        let spec: ExecSpec = serde_json::from_value(job.payload).context("exec payload")?;
        let mut c = Command::new(&spec.cmd);
        if !spec.args.is_empty() {
            c.args(&spec.args);
        }
        c.kill_on_drop(true);

        let run = async {
            let fut = c.status();
            let status = match spec.timeout_ms {
                Some(ms) => timeout(Duration::from_millis(ms), fut)
                    .await
                    .context("exec timeout")??,
                None => fut.await?,
            };
            anyhow::Ok(status)
        };

        let status = tokio::select! {
            r = run => r.with_context(|| format!("exec {}", spec.cmd))?,
            _ = ctx.cancel.cancelled() => bail!("exec cancelled"),
        };
        if !status.success() {
            bail!("exec exit status {:?}", status.code());
        }
        Ok(json!({ "exit_code": status.code() }))
    }
}

/// Payload of an `http` job.
#[cfg(feature = "runner-http")]
#[derive(Deserialize)]
pub struct HttpSpec {
    /// URL.
    pub url: String,
    /// Method (GET by default).
    #[serde(default)]
    pub method: Option<String>,
    /// Body (optional).
    #[serde(default)]
    pub body: Option<String>,
    /// Optional timeout (ms).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Performs one HTTP request; non-2xx fails the attempt.
#[cfg(feature = "runner-http")]
pub struct Http {
    client: reqwest::Client,
}

#[cfg(feature = "runner-http")]
impl Http {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[cfg(feature = "runner-http")]
#[async_trait]
impl JobHandler for Http {
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<Value> {
        let spec: HttpSpec = serde_json::from_value(job.payload).context("http payload")?;
        let method = spec.method.as_deref().unwrap_or("GET");
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .with_context(|| format!("http method {method}"))?;
        let mut req = self.client.request(method, &spec.url);
        if let Some(body) = spec.body {
            req = req.body(body);
        }
        if let Some(ms) = spec.timeout_ms {
            req = req.timeout(Duration::from_millis(ms));
        }

        let resp = tokio::select! {
            r = req.send() => r.with_context(|| format!("http {}", spec.url))?,
            _ = ctx.cancel.cancelled() => bail!("http cancelled"),
        };
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("http status {} from {}", status.as_u16(), spec.url);
        }
        Ok(json!({ "status": status.as_u16(), "body": body }))
    }
}
