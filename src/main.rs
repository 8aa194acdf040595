use anyhow::Result;
use clap::Parser;
use servman::audit::{AuditSink, FileAudit};
use servman::config::ConfigStore;
use servman::monitor::Monitor;
use servman::recovery;
use servman::supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Game-server fleet supervision daemon
#[derive(Parser)]
#[command(name = "servmand", version)]
struct Args {
    /// Fleet configuration file (TOML)
    #[arg(long, default_value = "fleet.toml")]
    config: PathBuf,

    /// Base directory holding server installs, steamcmd, and state
    #[arg(long, default_value = ".")]
    base_dir: PathBuf,

    /// Seconds between monitor passes
    #[arg(long, default_value_t = 30)]
    tick_secs: u64,

    /// Audit log path (defaults to <base-dir>/audit.log)
    #[arg(long)]
    audit_log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let audit_path = args
        .audit_log
        .unwrap_or_else(|| args.base_dir.join("audit.log"));

    let config = Arc::new(ConfigStore::new(&args.config, &args.base_dir));
    let audit: Arc<dyn AuditSink> = Arc::new(FileAudit::new(audit_path));
    let supervisor = Arc::new(Supervisor::new(config, audit));

    let adopted = recovery::recover_running(&supervisor).await;
    tracing::info!(
        "Supervising {} declared server(s), recovered {}",
        supervisor.config().server_names().len(),
        adopted
    );

    let monitor = Monitor::new(Arc::clone(&supervisor))
        .with_tick_interval(Duration::from_secs(args.tick_secs.max(1)));
    let monitor_task = tokio::spawn(monitor.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    monitor_task.abort();

    supervisor.stop_all().await;
    supervisor.flush_pid_cache().await;
    Ok(())
}
