use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a work item, assigned by the control plane.
pub type WorkItemId = String;

/// Caller-supplied key for a persisted execution context.
pub type SessionId = String;

/// Worker version reported on every poll.
pub const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Timeout applied to a work item that does not carry one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Control-plane endpoints, relative to the base URL.
pub mod endpoints {
    pub const POLL: &str = "functions/v1/bridge-poll";
    pub const STREAM: &str = "functions/v1/bridge-stream";
    pub const RESULT: &str = "functions/v1/bridge-result";
    pub const FILE_UPLOAD: &str = "functions/v1/bridge-file-upload";
    pub const FILE_DOWNLOAD: &str = "functions/v1/bridge-file-download";
}

/// Header carrying the worker's API key.
pub const API_KEY_HEADER: &str = "x-bridge-api-key";

/// What a work item asks the worker to do.
///
/// Unknown or missing `operation_type` values fall back to `Execute`, which is
/// the wire's `"command"`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    #[default]
    Execute,
    Upload,
    Download,
}

impl From<String> for OperationKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "upload" => OperationKind::Upload,
            "download" => OperationKind::Download,
            _ => OperationKind::Execute,
        }
    }
}

impl From<OperationKind> for String {
    fn from(kind: OperationKind) -> Self {
        kind.as_str().to_string()
    }
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Execute => "command",
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of dispatched work fetched from the control plane.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: WorkItemId,
    #[serde(default, rename = "operation_type")]
    pub operation: OperationKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

impl WorkItem {
    /// Effective timeout in seconds.
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    /// A short, single-line preview of the command for logs.
    pub fn command_preview(&self) -> String {
        let text = self.command.as_deref().unwrap_or_default();
        let first = text.lines().next().unwrap_or_default();
        first.chars().take(80).collect()
    }
}

/// Which output channel a line came from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamName::Stdout => f.write_str("stdout"),
            StreamName::Stderr => f.write_str("stderr"),
        }
    }
}

/// A captured line, newline stripped, tagged with its origin.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub content: String,
    pub stream: StreamName,
}

impl OutputLine {
    pub fn new(content: impl Into<String>, stream: StreamName) -> Self {
        Self {
            content: content.into(),
            stream,
        }
    }
}

/// Body of a `bridge-poll` request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PollRequest {
    pub worker_version: String,
    pub os_info: String,
    pub machine_name: String,
}

/// Body of a `bridge-poll` response. `command: null` means no work.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PollResponse {
    #[serde(default)]
    pub command: Option<WorkItem>,
}

/// Body of a `bridge-stream` request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StreamBatch {
    pub command_id: WorkItemId,
    pub lines: Vec<OutputLine>,
}

/// Body of a `bridge-result` request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResultSubmission {
    pub command_id: WorkItemId,
    pub output: String,
    pub exit_code: i32,
}

/// Body of a `bridge-file-upload` request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileUpload {
    pub command_id: WorkItemId,
    pub file_name: String,
    #[serde(with = "base64_bytes")]
    pub file_data: Vec<u8>,
}

/// Body of a `bridge-file-download` request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileDownloadRequest {
    pub command_id: WorkItemId,
}

/// Body of a `bridge-file-download` response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileDownload {
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(with = "base64_bytes")]
    pub file_data: Vec<u8>,
}

/// Human-readable OS description sent with each poll.
pub fn os_info() -> String {
    format!(
        "{} ({}, {})",
        std::env::consts::OS,
        std::env::consts::FAMILY,
        std::env::consts::ARCH
    )
}

/// Base64 encoding for byte arrays in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
