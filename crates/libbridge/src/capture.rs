use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use bridge_protocol::StreamName;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::output::SharedCapture;
use crate::session::EnvSnapshot;

/// Everything needed to start one child process.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub script: &'a str,
    /// Positional arguments after the script, starting with `$0`.
    pub args: &'a [OsString],
    pub cwd: Option<&'a Path>,
    pub env: &'a EnvSnapshot,
}

/// Starts child processes with piped stdout and stderr.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec<'_>) -> Result<Child, BridgeError>;
}

/// Runs the script through the platform shell (`sh -c` / `cmd /C`).
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    program: String,
    flag: String,
}

impl ShellLauncher {
    pub fn new(program: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            flag: flag.into(),
        }
    }
}

impl Default for ShellLauncher {
    fn default() -> Self {
        if cfg!(windows) {
            Self::new("cmd", "/C")
        } else {
            Self::new("sh", "-c")
        }
    }
}

impl Launcher for ShellLauncher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> Result<Child, BridgeError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.flag)
            .arg(spec.script)
            .args(spec.args)
            .env_clear()
            .envs(spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }
        // Own process group so a timeout can take down the whole pipeline.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(BridgeError::Spawn)
    }
}

/// Two reader tasks draining a child's stdout and stderr into one buffer.
pub struct Capture {
    buffer: SharedCapture,
    stdout: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

impl Capture {
    /// Take the child's pipes and start draining them.
    pub fn start(child: &mut Child) -> Result<Self, BridgeError> {
        let stdout = child
            .stdout
            .take()
            .ok_or(BridgeError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(BridgeError::MissingPipe("stderr"))?;

        let buffer = SharedCapture::new();
        let stdout = tokio::spawn(read_lines(stdout, StreamName::Stdout, buffer.clone()));
        let stderr = tokio::spawn(read_lines(stderr, StreamName::Stderr, buffer.clone()));

        Ok(Self {
            buffer,
            stdout,
            stderr,
        })
    }

    pub fn buffer(&self) -> &SharedCapture {
        &self.buffer
    }

    /// Both channels have reached EOF.
    pub fn is_finished(&self) -> bool {
        self.stdout.is_finished() && self.stderr.is_finished()
    }

    /// Wait for both readers and hand back the buffer.
    pub async fn join(self) -> Result<SharedCapture, BridgeError> {
        self.stdout.await?;
        self.stderr.await?;
        Ok(self.buffer)
    }

    /// Stop reading. Lines captured so far stay in the buffer.
    pub fn abort(self) -> SharedCapture {
        self.stdout.abort();
        self.stderr.abort();
        self.buffer
    }
}

async fn read_lines<R>(reader: R, stream: StreamName, buffer: SharedCapture)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => buffer.push(String::from_utf8_lossy(&line).into_owned(), stream),
            Err(e) => {
                warn!(%stream, error = %e, "output read failed");
                break;
            }
        }
    }
    debug!(%stream, "output channel closed");
}

/// Kill the child (and its process group on unix) and reap it.
pub async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        if let Ok(pgid) = libc::pid_t::try_from(pid) {
            // SAFETY: killpg has no memory-safety preconditions. The group was
            // created by `process_group(0)` at spawn, so its id equals the pid.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }

    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill failed, reaping child");
        let _ = child.wait().await;
    }
}

/// Exit code for a finished child. Signal deaths map to `128 + signal` on
/// unix, the shell convention.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
