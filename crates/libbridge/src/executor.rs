use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bridge_protocol::{SessionId, WorkItem, WorkItemId};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::capture::{self, Capture, LaunchSpec, Launcher, ShellLauncher};
use crate::control::OutputSink;
use crate::denylist::Denylist;
use crate::error::BridgeError;
use crate::output::{self, DEFAULT_MAX_OUTPUT_CHARS};
use crate::session::{ExecContext, SessionStore};
use crate::streamer::{BatchStreamer, DEFAULT_FLUSH_INTERVAL, DEFAULT_TICK_INTERVAL};

pub const BLOCKED_OUTPUT: &str = "BLOCKED: Dangerous command";
pub const TIMEOUT_OUTPUT: &str = "TIMEOUT";
pub const TIMEOUT_EXIT_CODE: i32 = 124;
pub const INTERNAL_ERROR_EXIT_CODE: i32 = 1;

/// Terminal outcome of one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub work_item_id: WorkItemId,
    pub output: String,
    pub exit_code: i32,
}

impl ExecutionResult {
    pub fn new(work_item_id: impl Into<WorkItemId>, output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            output: output.into(),
            exit_code,
        }
    }

    /// Result for a fault inside the worker itself.
    pub fn internal_error(work_item_id: impl Into<WorkItemId>, err: &BridgeError) -> Self {
        Self::new(work_item_id, err.to_result_text(), INTERNAL_ERROR_EXIT_CODE)
    }

    pub fn is_timeout(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE && self.output == TIMEOUT_OUTPUT
    }
}

/// One command to run.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub id: WorkItemId,
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub session_id: Option<SessionId>,
}

impl ExecRequest {
    pub fn from_work_item(item: &WorkItem) -> Result<Self, BridgeError> {
        let command = item
            .command
            .clone()
            .ok_or_else(|| BridgeError::MissingCommand(item.id.clone()))?;
        Ok(Self {
            id: item.id.clone(),
            command,
            working_dir: item.working_dir.clone(),
            timeout: Duration::from_secs(item.timeout_secs()),
            session_id: item.session_id.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub denylist: Denylist,
    /// Ceiling for the terminal output, in characters.
    pub max_output_chars: usize,
    pub flush_interval: Duration,
    pub tick_interval: Duration,
    /// Bound on the fallback `pwd` used to refresh a session's directory.
    pub cwd_query_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            denylist: Denylist::default(),
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            tick_interval: DEFAULT_TICK_INTERVAL,
            cwd_query_timeout: Duration::from_secs(5),
        }
    }
}

enum Outcome {
    Completed { output: String, exit_code: i32 },
    TimedOut,
}

/// Runs commands with streaming, timeout and session continuity.
#[derive(Debug, Clone, Default)]
pub struct Executor<L = ShellLauncher> {
    config: ExecutorConfig,
    launcher: L,
}

impl Executor<ShellLauncher> {
    pub fn new(config: ExecutorConfig) -> Self {
        Self::with_launcher(config, ShellLauncher::default())
    }
}

impl<L: Launcher> Executor<L> {
    pub fn with_launcher(config: ExecutorConfig, launcher: L) -> Self {
        Self { config, launcher }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Execute one command. Never fails: blocked commands, timeouts and
    /// internal faults all come back as an [`ExecutionResult`].
    pub async fn execute<S: OutputSink>(
        &self,
        sessions: &mut SessionStore,
        sink: &S,
        request: ExecRequest,
    ) -> ExecutionResult {
        if let Some(pattern) = self.config.denylist.matches(&request.command) {
            warn!(work_item_id = %request.id, pattern, "command blocked");
            return ExecutionResult::new(request.id, BLOCKED_OUTPUT, INTERNAL_ERROR_EXIT_CODE);
        }

        match self.run(sessions, sink, &request).await {
            Ok(Outcome::Completed { output, exit_code }) => {
                ExecutionResult::new(request.id, output, exit_code)
            }
            Ok(Outcome::TimedOut) => {
                warn!(
                    work_item_id = %request.id,
                    timeout_secs = request.timeout.as_secs(),
                    "command timed out"
                );
                ExecutionResult::new(request.id, TIMEOUT_OUTPUT, TIMEOUT_EXIT_CODE)
            }
            Err(e) => {
                warn!(work_item_id = %request.id, error = %e, "execution failed");
                ExecutionResult::internal_error(request.id, &e)
            }
        }
    }

    async fn run<S: OutputSink>(
        &self,
        sessions: &mut SessionStore,
        sink: &S,
        request: &ExecRequest,
    ) -> Result<Outcome, BridgeError> {
        let session_id = request.session_id.as_deref();
        if session_id.is_some() {
            sessions.expire();
        }
        let ctx = sessions.resolve(session_id, request.working_dir.clone());

        // The probe file lives until this function returns.
        let probe = match session_id {
            Some(_) if cfg!(unix) => Some(tempfile::NamedTempFile::new()?),
            _ => None,
        };
        let (script, args) = match &probe {
            Some(file) => (CWD_PROBE_SCRIPT, cwd_probe_args(&request.command, file.path())),
            None => (request.command.as_str(), Vec::new()),
        };

        let mut child = self.launcher.launch(&LaunchSpec {
            script,
            args: &args,
            cwd: ctx.cwd.as_deref(),
            env: &ctx.env,
        })?;
        let capture = Capture::start(&mut child)?;
        let mut streamer = BatchStreamer::new(sink, &request.id, self.config.flush_interval);
        debug!(work_item_id = %request.id, pid = ?child.id(), "command started");

        // `None` when the timeout is too large to represent: never expires.
        let deadline = Instant::now().checked_add(request.timeout);
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let status = loop {
            ticker.tick().await;
            streamer.tick(capture.buffer()).await;

            if capture.is_finished() {
                if let Some(status) = child.try_wait()? {
                    break status;
                }
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                capture::terminate(&mut child).await;
                let partial = capture.abort();
                streamer.finish(&partial).await;
                return Ok(Outcome::TimedOut);
            }
        };

        let buffer = capture.join().await?;
        streamer.finish(&buffer).await;
        let exit_code = capture::exit_code(status);
        let output = buffer.concat();

        if exit_code == 0 {
            if let Some(session_id) = session_id {
                let probed = probe.as_ref().and_then(|file| read_probe(file.path()));
                let cwd = match probed {
                    Some(cwd) => Some(cwd),
                    None => self.query_cwd(&ctx).await,
                };
                if let Some(cwd) = cwd {
                    sessions.record_cwd(session_id, cwd);
                }
            }
        }

        info!(
            work_item_id = %request.id,
            exit_code,
            chars = output.chars().count(),
            batches = streamer.batches_sent(),
            "command finished"
        );
        Ok(Outcome::Completed {
            output: output::truncate_output(output, self.config.max_output_chars),
            exit_code,
        })
    }

    /// Ask a fresh shell in `ctx` for its directory. Used when the command
    /// exited before the in-script probe could run.
    async fn query_cwd(&self, ctx: &ExecContext) -> Option<PathBuf> {
        let script = if cfg!(windows) { "cd" } else { "pwd" };
        let child = self
            .launcher
            .launch(&LaunchSpec {
                script,
                args: &[],
                cwd: ctx.cwd.as_deref(),
                env: &ctx.env,
            })
            .ok()?;
        let output = tokio::time::timeout(self.config.cwd_query_timeout, child.wait_with_output())
            .await
            .ok()?
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let cwd = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!cwd.is_empty()).then(|| PathBuf::from(cwd))
    }
}

/// Runs the command from `$1` through `eval`, then records the shell's final
/// directory in the file named by `$2` and exits with the command's status.
/// The command text is never spliced into this script.
const CWD_PROBE_SCRIPT: &str = "__bridge_command=$1
__bridge_probe=$2
set --
eval \"$__bridge_command\"
__bridge_status=$?
pwd > \"$__bridge_probe\" 2>/dev/null
exit $__bridge_status
";

/// Positional arguments for [`CWD_PROBE_SCRIPT`]: `$0`, the command, the
/// probe file.
fn cwd_probe_args(command: &str, probe: &Path) -> Vec<OsString> {
    vec![
        OsString::from("sh"),
        OsString::from(command),
        probe.as_os_str().to_owned(),
    ]
}

fn read_probe(path: &Path) -> Option<PathBuf> {
    let text = std::fs::read_to_string(path).ok()?;
    let cwd = text.trim();
    (!cwd.is_empty()).then(|| PathBuf::from(cwd))
}
