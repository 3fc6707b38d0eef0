use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use bridge_protocol::{OperationKind, WorkItem};
use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, DEFAULT_MAX_BACKOFF};
use crate::capture::{Launcher, ShellLauncher};
use crate::control::ControlPlane;
use crate::executor::{ExecRequest, ExecutionResult, Executor};
use crate::session::SessionStore;
use crate::transfer;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls, and the backoff floor.
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    /// Re-enter the poll loop after a crash instead of exiting.
    pub auto_restart: bool,
    pub restart_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_backoff: DEFAULT_MAX_BACKOFF,
            auto_restart: false,
            restart_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub total_executed: u64,
    pub last_error: Option<String>,
    pub started_at: Instant,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            total_executed: 0,
            last_error: None,
            started_at: Instant::now(),
        }
    }
}

/// The poll loop: fetch one work item, run it to completion, report, repeat.
pub struct Worker<C, L = ShellLauncher> {
    control: C,
    executor: Executor<L>,
    sessions: SessionStore,
    backoff: Backoff,
    stats: WorkerStats,
    config: WorkerConfig,
}

impl<C: ControlPlane, L: Launcher> Worker<C, L> {
    pub fn new(
        control: C,
        executor: Executor<L>,
        sessions: SessionStore,
        config: WorkerConfig,
    ) -> Self {
        Self {
            control,
            executor,
            sessions,
            backoff: Backoff::new(config.poll_interval, config.max_backoff),
            stats: WorkerStats::default(),
            config,
        }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// One poll cycle. Returns how long to sleep before the next one.
    pub async fn poll_once(&mut self) -> Duration {
        match self.control.poll().await {
            Err(e) => {
                let delay = self.backoff.on_failure();
                warn!(
                    error = %e,
                    failures = self.backoff.consecutive_failures(),
                    delay_ms = delay.as_millis() as u64,
                    "poll failed, backing off"
                );
                self.stats.last_error = Some(format!("{e:#}"));
                delay
            }
            Ok(item) => {
                self.backoff.reset();
                if let Some(item) = item {
                    self.dispatch(item).await;
                }
                self.config.poll_interval
            }
        }
    }

    /// Run one work item by kind and report its outcome.
    pub async fn dispatch(&mut self, item: WorkItem) {
        match item.operation {
            OperationKind::Execute => {
                info!(work_item_id = %item.id, command = %item.command_preview(), "executing");
                let result = match ExecRequest::from_work_item(&item) {
                    Ok(request) => {
                        self.executor
                            .execute(&mut self.sessions, &self.control, request)
                            .await
                    }
                    Err(e) => ExecutionResult::internal_error(item.id.clone(), &e),
                };
                self.submit(&result).await;
                info!(work_item_id = %item.id, exit_code = result.exit_code, "done");
            }
            OperationKind::Upload => {
                info!(work_item_id = %item.id, path = ?item.file_path, "uploading");
                if let Some(failure) = transfer::upload(&self.control, &item).await {
                    self.submit(&failure).await;
                }
            }
            OperationKind::Download => {
                info!(work_item_id = %item.id, path = ?item.file_path, "downloading");
                if let Some(failure) = transfer::download(&self.control, &item).await {
                    self.submit(&failure).await;
                }
            }
        }
        self.stats.total_executed += 1;
    }

    /// Poll until `shutdown` flips to `true`. The in-flight item always
    /// finishes first.
    pub async fn run(&mut self, shutdown: &mut watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "poll loop started"
        );
        while !*shutdown.borrow() {
            let delay = self.poll_once().await;
            if pause(delay, shutdown).await {
                break;
            }
        }
        info!(
            total_executed = self.stats.total_executed,
            uptime_secs = self.stats.started_at.elapsed().as_secs(),
            "poll loop stopped"
        );
    }

    /// Fire-and-forget result submission.
    async fn submit(&self, result: &ExecutionResult) {
        if let Err(e) = self.control.submit_result(result).await {
            warn!(work_item_id = %result.work_item_id, error = %e, "result submission dropped");
        }
    }
}

/// Run the poll loop, catching panics that escape it. With auto-restart the
/// loop is re-entered after `restart_delay`; otherwise the crash is returned.
pub async fn supervise<C: ControlPlane, L: Launcher>(
    worker: &mut Worker<C, L>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let crashed = AssertUnwindSafe(worker.run(shutdown)).catch_unwind().await;
        let Err(panic) = crashed else {
            return Ok(());
        };

        let message = panic_message(panic.as_ref());
        error!(error = %message, "worker crashed");
        if !worker.config.auto_restart {
            return Err(anyhow!("worker crashed: {message}"));
        }

        info!(
            delay_ms = worker.config.restart_delay.as_millis() as u64,
            "restarting poll loop"
        );
        if pause(worker.config.restart_delay, shutdown).await || *shutdown.borrow() {
            return Ok(());
        }
    }
}

/// Sleep for `delay`, returning early with `true` if shutdown is requested.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let stopped = async { shutdown.wait_for(|stop| *stop).await.is_ok() };
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        true = stopped => {
            debug!("shutdown requested");
            true
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
