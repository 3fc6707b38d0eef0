use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bridge_protocol::SessionId;
use tracing::{debug, info};

/// Sessions idle longer than this are dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Environment map handed to a child process.
pub type EnvSnapshot = HashMap<OsString, OsString>;

/// Persisted execution context for one session id.
#[derive(Debug, Clone)]
pub struct Session {
    pub cwd: PathBuf,
    env: EnvSnapshot,
    last_used: Instant,
}

impl Session {
    fn seeded() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            env: ambient_env(),
            last_used: Instant::now(),
        }
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }
}

/// Working directory and environment a command should run with.
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// `None` means inherit the worker's own directory.
    pub cwd: Option<PathBuf>,
    pub env: EnvSnapshot,
}

/// Maps session ids to their working directory and environment.
///
/// Not internally synchronized: callers hold it `&mut` for the duration of an
/// execution.
#[derive(Debug)]
pub struct SessionStore {
    sessions: HashMap<SessionId, Session>,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            idle_timeout,
        }
    }

    /// Resolve the context for an execution, creating the session on first
    /// reference. The returned environment is always a fresh copy.
    pub fn resolve(
        &mut self,
        session_id: Option<&str>,
        requested_cwd: Option<PathBuf>,
    ) -> ExecContext {
        let Some(session_id) = session_id else {
            return ExecContext {
                cwd: requested_cwd,
                env: ambient_env(),
            };
        };

        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!(session_id, "session created");
                Session::seeded()
            });
        session.last_used = Instant::now();

        ExecContext {
            cwd: Some(requested_cwd.unwrap_or_else(|| session.cwd.clone())),
            env: session.env.clone(),
        }
    }

    /// Overwrite the stored directory. Only called after a zero exit code.
    pub fn record_cwd(&mut self, session_id: &str, cwd: PathBuf) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            debug!(session_id, cwd = %cwd.display(), "session cwd updated");
            session.cwd = cwd;
        }
    }

    /// Drop every session idle longer than the threshold. Returns how many
    /// were removed.
    pub fn expire(&mut self) -> usize {
        let idle_timeout = self.idle_timeout;
        let before = self.sessions.len();
        self.sessions.retain(|session_id, session| {
            let keep = session.last_used.elapsed() <= idle_timeout;
            if !keep {
                info!(session_id = %session_id, "session expired");
            }
            keep
        });
        before - self.sessions.len()
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

fn ambient_env() -> EnvSnapshot {
    std::env::vars_os().collect()
}
