use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use lockrun_core::cfg::{self, AppId, Config};
use lockrun_core::lock;

use crate::exec::ActionTask;
use crate::runner::JobRunner;

mod exec;
mod runner;
#[cfg(test)]
mod runner_tests;

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"), // <- no literal; comes from crate name
};

#[derive(Parser)]
#[command(name=env!("CARGO_PKG_NAME"), version, about="Locked recurring job daemon")]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every configured job until interrupted.
    Run,
    /// Validate the configuration and print the resolved cadences.
    Check {
        /// Emit the table as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = cfg::load_or_init(&APP).context("config")?;
    let level = match cli.verbose {
        0 => cfg.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    lockrun_core::logx::init(level);

    match cli.cmd {
        Command::Check { json } => check(&cfg, json),
        Command::Run => build_runtime()?.block_on(run(cfg)),
    }
}

#[cfg(feature = "rt-single")]
fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build runtime")
}

#[cfg(not(feature = "rt-single"))]
fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .enable_all()
        .build()
        .context("build runtime")
}

async fn run(cfg: Config) -> Result<()> {
    let lock_root = cfg::lock_dir(&APP, &cfg)?;
    let lock = lock::open_default(&lock_root)?;

    let mut handles = Vec::new();
    for spec in &cfg.jobs {
        let schedule = spec.schedule().with_context(|| format!("job {}", spec.name))?;
        let task = ActionTask::new(spec.action.clone());
        let runner = JobRunner::new(spec.name.clone(), schedule, task, lock.clone());
        handles.push(runner.start());
        info!(
            "job {} started: every {:?}, hold {:?}..{:?}",
            spec.name, schedule.run_every, schedule.lock_at_least, schedule.lock_at_most
        );
    }
    if handles.is_empty() {
        warn!("no jobs configured");
    }
    info!("{} boot, lock dir {}", APP.application, lock_root.display());

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    for h in &mut handles {
        info!("stopping job {}", h.name());
        h.shutdown().await;
        debug!("job {} lifecycle {:?}", h.name(), h.lifecycle());
    }
    Ok(())
}

fn check(cfg: &Config, json: bool) -> Result<()> {
    let mut rows = Vec::new();
    for spec in &cfg.jobs {
        let schedule = spec.schedule().with_context(|| format!("job {}", spec.name))?;
        rows.push((spec.name.clone(), schedule));
    }

    if json {
        let jobs: Vec<_> = rows
            .iter()
            .map(|(name, s)| {
                serde_json::json!({
                    "name": name,
                    "run_every_ms": s.run_every.as_millis() as u64,
                    "lock_at_least_ms": s.lock_at_least.as_millis() as u64,
                    "lock_at_most_ms": s.lock_at_most.as_millis() as u64,
                })
            })
            .collect();
        let out = serde_json::json!({ "lock_dir": cfg.lock_dir, "jobs": jobs });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for (name, s) in &rows {
            println!(
                "job {name}: every {:?}, hold {:?}..{:?}",
                s.run_every, s.lock_at_least, s.lock_at_most
            );
        }
        println!("config ok: {} job(s)", rows.len());
    }
    Ok(())
}
