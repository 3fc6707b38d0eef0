pub mod backoff;
pub mod capture;
pub mod control;
pub mod denylist;
pub mod error;
pub mod executor;
pub mod output;
pub mod session;
pub mod streamer;
pub mod transfer;
pub mod worker;

pub use backoff::Backoff;
pub use capture::{LaunchSpec, Launcher, ShellLauncher};
pub use control::{ControlPlane, OutputSink};
pub use denylist::Denylist;
pub use error::BridgeError;
pub use executor::{ExecRequest, ExecutionResult, Executor, ExecutorConfig};
pub use session::{ExecContext, SessionStore};
pub use worker::{Worker, WorkerConfig, WorkerStats, supervise};
