//! Shared fakes for the libbridge integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow, bail};
use bridge_protocol::{FileDownload, FileUpload, OperationKind, OutputLine, StreamName, WorkItem};
use libbridge::error::BridgeError;
use libbridge::{ControlPlane, ExecutionResult, LaunchSpec, Launcher, OutputSink, ShellLauncher};
use tokio::process::Child;
use tokio::sync::watch;

/// What the fake control plane answers to the next poll.
pub enum PollScript {
    Work(WorkItem),
    Idle,
    TransportError,
    Panic,
}

/// Everything the worker sent to the control plane, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Batch(String, Vec<OutputLine>),
    Result(ExecutionResult),
    Upload(String, String, Vec<u8>),
}

/// Scripted control plane. Once the script runs out it requests shutdown and
/// reports no work.
#[derive(Default)]
pub struct FakeControl {
    script: Mutex<VecDeque<PollScript>>,
    sent: Mutex<Vec<Sent>>,
    downloads: Mutex<HashMap<String, FileDownload>>,
    polls: AtomicUsize,
    shutdown: Option<watch::Sender<bool>>,
    pub fail_uploads: bool,
}

impl FakeControl {
    pub fn scripted(script: Vec<PollScript>, shutdown: watch::Sender<bool>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            shutdown: Some(shutdown),
            ..Self::default()
        }
    }

    pub fn with_download(self, work_item_id: &str, download: FileDownload) -> Self {
        self.downloads
            .lock()
            .unwrap()
            .insert(work_item_id.to_string(), download);
        self
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn results(&self) -> Vec<ExecutionResult> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Result(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// All streamed lines, flattened in send order.
    pub fn streamed_lines(&self) -> Vec<OutputLine> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Batch(_, lines) => Some(lines),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl OutputSink for FakeControl {
    async fn send_batch(&self, work_item_id: &str, lines: Vec<OutputLine>) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Batch(work_item_id.to_string(), lines));
        Ok(())
    }
}

impl ControlPlane for FakeControl {
    async fn poll(&self) -> Result<Option<WorkItem>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(PollScript::Work(item)) => Ok(Some(item)),
            Some(PollScript::Idle) => Ok(None),
            Some(PollScript::TransportError) => Err(anyhow!("connection refused")),
            Some(PollScript::Panic) => panic!("poll handler exploded"),
            None => {
                if let Some(tx) = &self.shutdown {
                    tx.send_replace(true);
                }
                Ok(None)
            }
        }
    }

    async fn submit_result(&self, result: &ExecutionResult) -> Result<()> {
        self.sent.lock().unwrap().push(Sent::Result(result.clone()));
        Ok(())
    }

    async fn upload_file(&self, upload: FileUpload) -> Result<()> {
        if self.fail_uploads {
            bail!("status 500");
        }
        self.sent.lock().unwrap().push(Sent::Upload(
            upload.command_id,
            upload.file_name,
            upload.file_data,
        ));
        Ok(())
    }

    async fn download_file(&self, work_item_id: &str) -> Result<FileDownload> {
        self.downloads
            .lock()
            .unwrap()
            .remove(work_item_id)
            .ok_or_else(|| anyhow!("status 404"))
    }
}

/// Shell launcher that counts spawns and remembers child pids.
#[derive(Default)]
pub struct CountingLauncher {
    inner: ShellLauncher,
    spawns: AtomicUsize,
    pids: Mutex<Vec<u32>>,
}

impl CountingLauncher {
    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn pids(&self) -> Vec<u32> {
        self.pids.lock().unwrap().clone()
    }
}

impl Launcher for CountingLauncher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> Result<Child, BridgeError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let child = self.inner.launch(spec)?;
        if let Some(pid) = child.id() {
            self.pids.lock().unwrap().push(pid);
        }
        Ok(child)
    }
}

pub fn execute_item(id: &str, command: &str) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        operation: OperationKind::Execute,
        command: Some(command.to_string()),
        working_dir: None,
        timeout_seconds: None,
        session_id: None,
        file_path: None,
    }
}

/// Contents of `lines` from one origin, in order.
pub fn lines_from(lines: &[OutputLine], stream: StreamName) -> Vec<String> {
    lines
        .iter()
        .filter(|l| l.stream == stream)
        .map(|l| l.content.clone())
        .collect()
}
