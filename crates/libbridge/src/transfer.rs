//! File transfer work items.
//!
//! Success is acknowledged by the transfer endpoint itself. Failures come
//! back as an [`ExecutionResult`] for the caller to submit.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bridge_protocol::{FileUpload, WorkItem};
use tracing::info;

use crate::control::ControlPlane;
use crate::executor::{ExecutionResult, INTERNAL_ERROR_EXIT_CODE};

/// Fallback target when neither the work item nor the control plane names one.
pub const DEFAULT_DOWNLOAD_NAME: &str = "downloaded_file";

/// Read a local file and send it to the control plane.
pub async fn upload<C: ControlPlane>(control: &C, item: &WorkItem) -> Option<ExecutionResult> {
    let path = match item.file_path.as_deref() {
        Some(path) if !path.as_os_str().is_empty() && path.exists() => path,
        other => {
            let shown = other.map(|p| p.display().to_string()).unwrap_or_default();
            return Some(failure(item, format!("File not found: {shown}")));
        }
    };

    match send_file(control, item, path).await {
        Ok(bytes) => {
            info!(work_item_id = %item.id, path = %path.display(), bytes, "file uploaded");
            None
        }
        Err(e) => Some(failure(item, format!("Upload failed: {e:#}"))),
    }
}

/// Fetch a file from the control plane and write it locally.
pub async fn download<C: ControlPlane>(control: &C, item: &WorkItem) -> Option<ExecutionResult> {
    match fetch_file(control, item).await {
        Ok((path, bytes)) => {
            info!(work_item_id = %item.id, path = %path.display(), bytes, "file downloaded");
            None
        }
        Err(e) => Some(failure(item, format!("Download failed: {e:#}"))),
    }
}

async fn send_file<C: ControlPlane>(control: &C, item: &WorkItem, path: &Path) -> Result<usize> {
    let file_data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let bytes = file_data.len();
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    control
        .upload_file(FileUpload {
            command_id: item.id.clone(),
            file_name,
            file_data,
        })
        .await?;
    Ok(bytes)
}

async fn fetch_file<C: ControlPlane>(control: &C, item: &WorkItem) -> Result<(PathBuf, usize)> {
    let download = control.download_file(&item.id).await?;
    let path = item
        .file_path
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .or(download.file_path)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_NAME));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&path, &download.file_data)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok((path, download.file_data.len()))
}

fn failure(item: &WorkItem, message: String) -> ExecutionResult {
    ExecutionResult::new(item.id.clone(), message, INTERNAL_ERROR_EXIT_CODE)
}
