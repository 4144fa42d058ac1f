use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use csm::config::{MasterConfig, WorkerConfig};
use csm::master::MasterContext;
use csm::worker::{TmuxMultiplexer, WorkerAgent, WorkerStateStore};

#[derive(Parser)]
#[command(name = "csm", about = "Claude Session Manager — master/worker coordination plane", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the master: aggregates worker events and serves the HTTP/SSE/WS API.
    Master {
        /// HTTP listen port
        #[arg(long, env = "CSM_PORT")]
        port: Option<u16>,
        /// Data directory for config.toml and the auth token
        #[arg(long, env = "CSM_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Log level (trace, debug, info, warn, error)
        #[arg(long, env = "CSM_LOG")]
        log: Option<String>,
    },
    /// Run a worker: polls local tmux sessions and pushes state to a master.
    Worker {
        /// This worker's id (default: sanitized hostname)
        #[arg(long, env = "CSM_WORKER_ID")]
        worker_id: Option<String>,
        /// Master base URL to push events to (e.g. http://localhost:4300).
        /// If omitted, the worker runs in pure local mode and queues
        /// events indefinitely.
        #[arg(long, env = "CSM_MASTER_URL")]
        master_url: Option<String>,
        /// Data directory for worker_state.json
        #[arg(long, env = "CSM_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Log level (trace, debug, info, warn, error)
        #[arg(long, env = "CSM_LOG")]
        log: Option<String>,
        /// Multiplexer poll interval, in seconds
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Heartbeat push interval, in seconds
        #[arg(long)]
        heartbeat_interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Master { port, data_dir, log } => {
            setup_logging(log.as_deref().unwrap_or("info"));
            run_master(port, data_dir, log).await
        }
        Command::Worker { worker_id, master_url, data_dir, log, poll_interval, heartbeat_interval } => {
            setup_logging(log.as_deref().unwrap_or("info"));
            run_worker(worker_id, master_url, data_dir, log, poll_interval, heartbeat_interval).await
        }
    }
}

fn setup_logging(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .init();
}

async fn run_master(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Result<()> {
    let config = MasterConfig::new(port, data_dir, log);
    info!(port = config.port, data_dir = %config.data_dir.display(), "csm master starting");

    std::fs::create_dir_all(&config.data_dir).context("creating master data directory")?;

    let ctx = MasterContext::new(config);
    let token = ctx.tokens.get_or_create().context("generating auth token")?;
    info!(token = %token, "auth token ready — pass via Authorization: Bearer <token> or ?token=");

    let addr = format!("0.0.0.0:{}", ctx.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "listening");

    let app = csm::api::router(ctx);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("master stopped");
    Ok(())
}

async fn run_worker(
    worker_id: Option<String>,
    master_url: Option<String>,
    data_dir: Option<PathBuf>,
    log: Option<String>,
    poll_interval: Option<u64>,
    heartbeat_interval: Option<u64>,
) -> Result<()> {
    let config = WorkerConfig::new(worker_id, master_url, data_dir, log, poll_interval, heartbeat_interval);
    info!(
        worker_id = %config.worker_id,
        master_url = ?config.master_url,
        data_dir = %config.data_dir.display(),
        "csm worker starting"
    );
    if config.master_url.is_none() {
        warn!("no master url configured — running in pure local mode, events will queue indefinitely");
    }

    let store = WorkerStateStore::load(&config.data_dir, &config.worker_id).context("loading worker state store")?;
    let multiplexer = Arc::new(TmuxMultiplexer);
    let agent = Arc::new(WorkerAgent::new(config, store, multiplexer));

    let run_agent = agent.clone();
    let run_handle = tokio::spawn(async move { run_agent.run().await });

    shutdown_signal().await;
    info!("shutdown signal received — stopping worker agent");
    agent.stop();
    let _ = run_handle.await;

    info!("worker stopped");
    Ok(())
}

/// Resolves on SIGTERM (Unix) or Ctrl-C (all platforms).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
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
