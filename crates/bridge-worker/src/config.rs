use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use libbridge::backoff::DEFAULT_MAX_BACKOFF;
use libbridge::output::DEFAULT_MAX_OUTPUT_CHARS;
use libbridge::session::DEFAULT_IDLE_TIMEOUT;
use libbridge::{Denylist, ExecutorConfig, WorkerConfig};
use serde::Deserialize;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:54321";
pub const DEFAULT_MACHINE_NAME: &str = "default";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_RESTART_DELAY_SECS: u64 = 5;

#[derive(Parser, Debug, Default)]
#[command(
    name = "bridge-worker",
    version,
    about = "Poll the bridge control plane and run the commands it hands out"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Control-plane base URL.
    #[arg(long, env = "BRIDGE_BASE_URL", global = true)]
    pub base_url: Option<String>,

    /// API key sent with every request.
    #[arg(long = "key", env = "BRIDGE_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// Name this machine reports when polling.
    #[arg(long = "name", env = "MACHINE_NAME", global = true)]
    pub machine_name: Option<String>,

    /// Seconds between polls.
    #[arg(long = "poll-interval", env = "POLL_INTERVAL", global = true)]
    pub poll_interval: Option<u64>,

    /// Restart the poll loop after a crash instead of exiting.
    #[arg(long, global = true)]
    pub auto_restart: bool,

    /// Config file (defaults to ~/.config/bridge-worker/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Command {
    /// Start polling for work.
    #[default]
    Start,
}

/// `$XDG_CONFIG_HOME/bridge-worker/config.toml`, else under `~/.config`.
/// With neither variable set (service managers often run without `HOME`)
/// the file is looked up under `/tmp/bridge-worker` and is usually absent.
pub fn default_config_path() -> PathBuf {
    let dir = if let Some(config_home) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(config_home)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".config")
    } else {
        PathBuf::from("/tmp")
    };
    dir.join("bridge-worker").join("config.toml")
}

/// Contents of the TOML config file. Every key is optional.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub machine_name: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub auto_restart: Option<bool>,
    pub max_backoff_secs: Option<u64>,
    pub restart_delay_secs: Option<u64>,
    pub session_idle_secs: Option<u64>,
    pub max_output_chars: Option<usize>,
    pub extra_blocked_patterns: Vec<String>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }
}

/// Fully resolved worker settings.
#[derive(Clone)]
pub struct Settings {
    pub base_url: String,
    pub api_key: String,
    pub machine_name: String,
    pub poll_interval: Duration,
    pub auto_restart: bool,
    pub max_backoff: Duration,
    pub restart_delay: Duration,
    pub session_idle: Duration,
    pub max_output_chars: usize,
    pub extra_blocked_patterns: Vec<String>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("machine_name", &self.machine_name)
            .field("poll_interval", &self.poll_interval)
            .field("auto_restart", &self.auto_restart)
            .field("max_backoff", &self.max_backoff)
            .field("restart_delay", &self.restart_delay)
            .field("session_idle", &self.session_idle)
            .field("max_output_chars", &self.max_output_chars)
            .field("extra_blocked_patterns", &self.extra_blocked_patterns)
            .finish()
    }
}

impl Settings {
    /// Read the config file named by `--config`, or the default one if it
    /// exists, and layer `args` over it.
    pub fn load(args: &Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::read(path)?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    FileConfig::read(&path)?
                } else {
                    FileConfig::default()
                }
            }
        };
        Self::resolve(args, file)
    }

    /// Flags and environment win over the file, the file wins over defaults.
    pub fn resolve(args: &Args, file: FileConfig) -> Result<Self> {
        let api_key = args
            .api_key
            .clone()
            .or(file.api_key)
            .map(|key| key.trim().to_string())
            .unwrap_or_default();
        if api_key.is_empty() {
            bail!("API key required: pass --key or set BRIDGE_API_KEY");
        }

        let base_url = args
            .base_url
            .clone()
            .or(file.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        if base_url.is_empty() {
            bail!("base URL must not be empty");
        }

        let poll_interval_secs = args
            .poll_interval
            .or(file.poll_interval_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        if poll_interval_secs == 0 {
            bail!("poll interval must be at least 1 second");
        }

        let machine_name = args
            .machine_name
            .clone()
            .or(file.machine_name)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MACHINE_NAME.to_string());

        Ok(Self {
            base_url,
            api_key,
            machine_name,
            poll_interval: Duration::from_secs(poll_interval_secs),
            auto_restart: args.auto_restart || file.auto_restart.unwrap_or(false),
            max_backoff: file
                .max_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_MAX_BACKOFF),
            restart_delay: Duration::from_secs(
                file.restart_delay_secs.unwrap_or(DEFAULT_RESTART_DELAY_SECS),
            ),
            session_idle: file
                .session_idle_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
            max_output_chars: file.max_output_chars.unwrap_or(DEFAULT_MAX_OUTPUT_CHARS),
            extra_blocked_patterns: file.extra_blocked_patterns,
        })
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            denylist: Denylist::with_extra(self.extra_blocked_patterns.iter().cloned()),
            max_output_chars: self.max_output_chars,
            ..ExecutorConfig::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            max_backoff: self.max_backoff,
            auto_restart: self.auto_restart,
            restart_delay: self.restart_delay,
        }
    }
}
