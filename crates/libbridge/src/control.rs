use std::future::Future;

use anyhow::Result;
use bridge_protocol::{FileDownload, FileUpload, OutputLine, WorkItem};

use crate::executor::ExecutionResult;

/// Destination for live output batches.
pub trait OutputSink: Send + Sync {
    fn send_batch(
        &self,
        work_item_id: &str,
        lines: Vec<OutputLine>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// The pull-based control plane the worker talks to.
pub trait ControlPlane: OutputSink {
    /// Fetch the next work item. `Ok(None)` means no work; `Err` is a
    /// transport failure.
    fn poll(&self) -> impl Future<Output = Result<Option<WorkItem>>> + Send;

    fn submit_result(&self, result: &ExecutionResult) -> impl Future<Output = Result<()>> + Send;

    fn upload_file(&self, upload: FileUpload) -> impl Future<Output = Result<()>> + Send;

    fn download_file(&self, work_item_id: &str)
    -> impl Future<Output = Result<FileDownload>> + Send;
}
