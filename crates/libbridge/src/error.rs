use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("child process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("output reader failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("work item {0} has no command text")]
    MissingCommand(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Text reported to the control plane for an internal fault.
    pub fn to_result_text(&self) -> String {
        format!("ERROR: {self}")
    }
}
