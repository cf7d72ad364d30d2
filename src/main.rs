#![forbid(unsafe_code)]

//! `awcpd` — Agent Workspace Collaboration Protocol daemon.
//!
//! Bootstraps configuration, starts the delegator control plane and/or the
//! executor protocol endpoint, and handles graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use awcp::config::GlobalConfig;
use awcp::delegator::api as delegator_api;
use awcp::delegator::engine::DelegatorEngine;
use awcp::executor::api as executor_api;
use awcp::executor::engine::ExecutorEngine;
use awcp::executor::runner::{CommandTaskRunner, LoggingTaskRunner, TaskRunner};
use awcp::transport::local_dir::LocalDirTransport;
use awcp::{AwcpError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Which protocol role(s) to run.
#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Role {
    /// Delegator control plane only.
    Delegator,
    /// Executor protocol endpoint only.
    Executor,
    /// Both roles in one process (single-host deployments).
    Both,
}

#[derive(Debug, Parser)]
#[command(name = "awcpd", about = "Agent workspace delegation daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "awcp.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Which protocol role(s) to run.
    #[arg(long, value_enum, default_value_t = Role::Both)]
    role: Role,

    /// Override the delegator state root.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Override the executor work root.
    #[arg(long)]
    work_root: Option<PathBuf>,

    /// Override the default executor peer URL.
    #[arg(long)]
    peer: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("awcpd bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AwcpError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(base_dir) = args.base_dir {
        config.base_dir = base_dir;
    }
    if let Some(work_root) = args.work_root {
        if let Some(executor) = config.executor.as_mut() {
            executor.work_root = work_root;
        }
    }
    if let Some(peer) = args.peer {
        config.delegator.peer_url = Some(peer);
    }
    std::fs::create_dir_all(&config.base_dir)
        .map_err(|err| AwcpError::Config(format!("cannot create base_dir: {err}")))?;
    info!("configuration loaded");

    let ct = CancellationToken::new();
    let transport = Arc::new(LocalDirTransport::new());
    let sweep = config.lifecycle.cleanup_stale_on_startup;

    // ── Executor role ───────────────────────────────────
    let run_executor = matches!(args.role, Role::Executor | Role::Both);
    let (executor_engine, executor_handle) = if run_executor {
        let executor_config = config.executor.clone().ok_or_else(|| {
            AwcpError::Config("executor role requested but [executor] is not configured".into())
        })?;
        let runner: Arc<dyn TaskRunner> = match &executor_config.task_command {
            Some(command) => Arc::new(CommandTaskRunner::new(command)?),
            None => Arc::new(LoggingTaskRunner),
        };
        let port = executor_config.listen_port;
        let engine = ExecutorEngine::new(
            executor_config,
            Arc::clone(&transport) as Arc<dyn awcp::transport::ExecutorTransport>,
            runner,
            ct.child_token(),
        )?;
        engine.initialize(sweep).await?;

        let serve_engine = engine.clone();
        let serve_ct = ct.clone();
        let shutdown_ct = ct.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = executor_api::serve(serve_engine, port, serve_ct).await {
                error!(%err, "executor endpoint failed — initiating shutdown");
                shutdown_ct.cancel();
            }
        });
        info!(port, "executor role started");
        (Some(engine), Some(handle))
    } else {
        (None, None)
    };

    // ── Delegator role ──────────────────────────────────
    let run_delegator = matches!(args.role, Role::Delegator | Role::Both);
    let (delegator_engine, delegator_handle, reaper_handle) = if run_delegator {
        let engine = DelegatorEngine::new(
            &config,
            Arc::clone(&transport) as Arc<dyn awcp::transport::DelegatorTransport>,
            ct.child_token(),
        )?;
        engine.startup(sweep).await?;

        let port = config.delegator.listen_port;
        let serve_engine = engine.clone();
        let serve_ct = ct.clone();
        let shutdown_ct = ct.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = delegator_api::serve(serve_engine, port, serve_ct).await {
                error!(%err, "control plane failed — initiating shutdown");
                shutdown_ct.cancel();
            }
        });

        let reaper = spawn_retention_reaper(engine.clone(), ct.clone());
        info!(port, "delegator role started");
        (Some(engine), Some(handle), Some(reaper))
    } else {
        (None, None, None)
    };

    info!(role = ?args.role, "awcpd ready");

    // ── Wait for first shutdown signal ──────────────────
    shutdown_signal().await;
    info!("shutdown signal received — starting graceful shutdown");
    ct.cancel();

    // A second signal force-exits.
    tokio::spawn(async {
        shutdown_signal().await;
        error!("second shutdown signal received — forcing exit");
        std::process::exit(1);
    });

    // ── Graceful shutdown with timeout ───────────────────
    let cleanup = config.lifecycle.cleanup_on_shutdown;
    let shutdown_fut = async {
        if cleanup {
            if let Some(engine) = &executor_engine {
                engine.shutdown_cleanup().await;
            }
        }
        drop(delegator_engine);
        if let Some(handle) = executor_handle {
            let _ = handle.await;
        }
        if let Some(handle) = delegator_handle {
            let _ = handle.await;
        }
        if let Some(handle) = reaper_handle {
            let _ = handle.await;
        }
    };

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown_fut)
        .await
        .is_err()
    {
        error!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "graceful shutdown timed out — exiting"
        );
    }

    info!("awcpd shut down");
    Ok(())
}

/// Maximum time to wait for graceful shutdown before force-exiting.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between retention reaper passes.
const REAP_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the background task that purges expired terminal delegations.
fn spawn_retention_reaper(
    engine: DelegatorEngine,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention reaper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    engine.reap_expired().await;
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AwcpError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AwcpError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
