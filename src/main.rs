use anyhow::Result;
use clap::{Parser, Subcommand};
use reviewd::{
    branches::BranchWatcher,
    capabilities::{EnvironmentDetector, GitEnvironmentDetector},
    config::DaemonConfig,
    identity,
    recovery::recover_orphaned_tasks,
    server::Listener,
    store::json_file::JsonFileStore,
    worktrees::cleanup_stale_setup_entries,
    AppContext,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "reviewd",
    about = "Review bridge — local daemon linking the review UI to coding agents",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// WebSocket + HTTP listener port
    #[arg(long, env = "REVIEWD_PORT")]
    port: Option<u16>,

    /// Data directory for the machine-id cache and local store
    #[arg(long, env = "REVIEWD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "REVIEWD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "REVIEWD_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Agent CLI binary to spawn (default: claude)
    #[arg(long, env = "REVIEWD_AGENT_BIN")]
    agent_bin: Option<String>,

    /// Repository path to track for branch changes; repeatable.
    #[arg(long = "environment")]
    environments: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon in the foreground (default when no subcommand given).
    Serve,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::new(
        args.port,
        args.data_dir.clone(),
        args.log.clone(),
        args.agent_bin.clone(),
    );

    let _log_guard = init_tracing(&config.log, args.log_file.as_deref());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(serve(config, args.environments))
        }
    }
}

async fn serve(config: DaemonConfig, environment_paths: Vec<PathBuf>) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        "reviewd starting"
    );

    let machine_id = match identity::get_or_create(&config.data_dir) {
        Ok(id) => id,
        Err(e) => {
            warn!(err = %e, "failed to resolve machine identity — using fallback");
            "unknown-machine".to_string()
        }
    };

    // ── Startup repair passes (before anything serves traffic) ───────────────
    let store = Arc::new(JsonFileStore::new(&config.data_dir));
    match recover_orphaned_tasks(store.as_ref()).await {
        Ok(0) => {}
        Ok(count) => info!(count, "recovered orphaned tasks from previous run"),
        Err(e) => warn!(err = %e, "task recovery pass failed — continuing startup"),
    }
    cleanup_stale_setup_entries(store.as_ref(), &machine_id).await;

    let ctx = AppContext::new(config, machine_id);

    // ── Listener (bind failure is survivable) ────────────────────────────────
    let listener = Listener::new(Arc::clone(&ctx));
    match listener.start().await {
        Some(port) => info!(port, "accepting review UI connections"),
        None => warn!("running without a listener — restart to retry the bind"),
    }

    // ── Branch tracking ──────────────────────────────────────────────────────
    let detector: Arc<dyn EnvironmentDetector> = Arc::new(GitEnvironmentDetector);
    let mut environments = Vec::new();
    for path in &environment_paths {
        match detector.detect(path).await {
            Ok(Some(env)) => environments.push(env),
            Ok(None) => warn!(path = %path.display(), "not a git repository — skipped"),
            Err(e) => warn!(path = %path.display(), err = %e, "environment detection failed"),
        }
    }
    let watcher = BranchWatcher::spawn(environments, detector, |list| {
        for env in &list {
            info!(path = %env.path, branch = %env.branch, "environment updated");
        }
    });

    // ── Run until a shutdown signal ──────────────────────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received — stopping agents and watchers");
    ctx.spawner.stop_all().await;
    watcher.close();
    ctx.pty.dispose();
    info!("reviewd stopped");
    Ok(())
}

/// Resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

fn init_tracing(
    filter: &str,
    log_file: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "reviewd.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    }
}
