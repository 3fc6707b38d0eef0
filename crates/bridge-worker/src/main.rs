mod client;
mod config;

use anyhow::Result;
use bridge_protocol::WORKER_VERSION;
use clap::Parser;
use libbridge::{Executor, SessionStore, Worker, supervise};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::client::HttpControlPlane;
use crate::config::{Args, Command, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("bridge_worker=info,libbridge=info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args)?;

    match args.command.unwrap_or_default() {
        Command::Start => start(settings).await,
    }
}

async fn start(settings: Settings) -> Result<()> {
    info!(
        version = WORKER_VERSION,
        base_url = %settings.base_url,
        machine_name = %settings.machine_name,
        auto_restart = settings.auto_restart,
        "bridge worker starting"
    );

    let control = HttpControlPlane::new(
        &settings.base_url,
        &settings.api_key,
        &settings.machine_name,
    )?;
    let executor = Executor::new(settings.executor_config());
    let sessions = SessionStore::new(settings.session_idle);
    let mut worker = Worker::new(control, executor, sessions, settings.worker_config());

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested, finishing in-flight work");
        shutdown_tx.send_replace(true);
    });

    supervise(&mut worker, &mut shutdown_rx).await?;

    info!(
        total_executed = worker.stats().total_executed,
        "bridge worker stopped"
    );
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
