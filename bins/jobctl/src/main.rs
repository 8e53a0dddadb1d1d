use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobq_core::cfg::{self, AppId, Config};
use jobq_core::store::{self, DefaultKv, KvJobRepo};
use jobq_core::{logx, CreateOptions, JobFilter, JobManager, JobStatus};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

/// The CLI shares the daemon's config and store.
const DAEMON: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: "jobqd",
};

#[derive(Parser)]
#[command(name=env!("CARGO_PKG_NAME"), version, about="Inspect and manage the jobqd queue")]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Config file (defaults to the daemon's config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Store directory; skips the daemon config when no --config is given.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a job.
    Create {
        /// Handler type, e.g. `echo`.
        job_type: String,
        /// JSON payload.
        #[arg(long, default_value = "null")]
        payload: String,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// List jobs, newest first.
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long = "type")]
        job_type: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print one job.
    Show { id: String },
    /// Print a job's log entries.
    Logs { id: String },
    /// Cancel a pending or running job.
    Cancel { id: String },
    /// Remove a job record.
    Delete { id: String },
    /// Remove terminal jobs older than the retention window.
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Job counts per status.
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;
    logx::init(logx::level_for_verbosity("warn", cli.verbose));

    let dir = match &cli.data_dir {
        Some(d) => d.clone(),
        None => cfg::data_dir(&DAEMON, &cfg)?,
    };
    debug!("store dir={}", dir.display());
    let kv = store::open_default(&dir)?;
    let manager = JobManager::new(KvJobRepo::new(kv), &cfg.queue);
    run(cli.cmd, &manager, &cfg)
}

fn load_config(cli: &Cli) -> Result<Config> {
    match (&cli.config, &cli.data_dir) {
        (Some(path), _) => cfg::load_from(path),
        (None, Some(_)) => Ok(Config::default()),
        (None, None) => cfg::load_or_init(&DAEMON),
    }
}

fn run(cmd: Command, manager: &JobManager<KvJobRepo<DefaultKv>>, cfg: &Config) -> Result<()> {
    match cmd {
        Command::Create { job_type, payload, max_retries } => {
            let payload: Value = serde_json::from_str(&payload).context("--payload must be JSON")?;
            let job = manager.create_job(job_type, payload, CreateOptions { max_retries })?;
            info!("created id={} type={}", job.id, job.job_type);
            print(&job)
        }
        Command::List { status, job_type, limit } => {
            let jobs = manager.get_jobs(&JobFilter { status, job_type, limit })?;
            print(&jobs)
        }
        Command::Show { id } => match manager.get_job(&id)? {
            Some(job) => print(&job),
            None => bail!("no job {id}"),
        },
        Command::Logs { id } => print(&manager.get_logs(&id)?),
        Command::Cancel { id } => {
            let cancelled = manager.cancel_job(&id)?;
            info!("cancel id={} -> {}", id, cancelled);
            print(&json!({ "id": id, "cancelled": cancelled }))
        }
        Command::Delete { id } => {
            let deleted = manager.delete_job(&id)?;
            print(&json!({ "id": id, "deleted": deleted }))
        }
        Command::Cleanup { days } => {
            let days = days.unwrap_or(cfg.queue.retention_days);
            let removed = manager.cleanup_old_jobs(days)?;
            print(&json!({ "removed": removed, "days_to_keep": days }))
        }
        Command::Stats => print(&manager.stats()?),
    }
}

fn print<T: Serialize + ?Sized>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}
