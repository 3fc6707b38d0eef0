//! HTTP control-plane client.

use std::time::Duration;

use anyhow::{Context, Result};
use bridge_protocol::{
    API_KEY_HEADER, FileDownload, FileDownloadRequest, FileUpload, OutputLine, PollRequest,
    PollResponse, ResultSubmission, StreamBatch, WORKER_VERSION, WorkItem, endpoints,
};
use libbridge::{ControlPlane, ExecutionResult, OutputSink};
use serde::Serialize;

/// Timeout for poll, stream and result calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for file upload and download.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    machine_name: String,
    os_info: String,
}

impl HttpControlPlane {
    pub fn new(base_url: &str, api_key: &str, machine_name: &str) -> Result<Self> {
        reqwest::Url::parse(base_url).with_context(|| format!("invalid base URL {base_url}"))?;
        let client = reqwest::Client::builder()
            .user_agent(format!("bridge-worker/{WORKER_VERSION}"))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            machine_name: machine_name.to_string(),
            os_info: bridge_protocol::os_info(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_url)
    }

    /// POST `body` as JSON. Any non-success status is an error.
    async fn post<B>(&self, endpoint: &str, body: &B, timeout: Duration) -> Result<reqwest::Response>
    where
        B: Serialize + Sync + ?Sized,
    {
        self.client
            .post(self.url(endpoint))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .with_context(|| format!("{endpoint} request failed"))?
            .error_for_status()
            .with_context(|| format!("{endpoint} returned an error"))
    }
}

impl OutputSink for HttpControlPlane {
    async fn send_batch(&self, work_item_id: &str, lines: Vec<OutputLine>) -> Result<()> {
        let batch = StreamBatch {
            command_id: work_item_id.to_string(),
            lines,
        };
        self.post(endpoints::STREAM, &batch, REQUEST_TIMEOUT).await?;
        Ok(())
    }
}

impl ControlPlane for HttpControlPlane {
    async fn poll(&self) -> Result<Option<WorkItem>> {
        let request = PollRequest {
            worker_version: WORKER_VERSION.to_string(),
            os_info: self.os_info.clone(),
            machine_name: self.machine_name.clone(),
        };
        let response: PollResponse = self
            .post(endpoints::POLL, &request, REQUEST_TIMEOUT)
            .await?
            .json()
            .await
            .context("failed to parse poll response")?;
        Ok(response.command)
    }

    async fn submit_result(&self, result: &ExecutionResult) -> Result<()> {
        let submission = ResultSubmission {
            command_id: result.work_item_id.clone(),
            output: result.output.clone(),
            exit_code: result.exit_code,
        };
        self.post(endpoints::RESULT, &submission, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    async fn upload_file(&self, upload: FileUpload) -> Result<()> {
        self.post(endpoints::FILE_UPLOAD, &upload, TRANSFER_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn download_file(&self, work_item_id: &str) -> Result<FileDownload> {
        let request = FileDownloadRequest {
            command_id: work_item_id.to_string(),
        };
        self.post(endpoints::FILE_DOWNLOAD, &request, TRANSFER_TIMEOUT)
            .await?
            .json()
            .await
            .context("failed to parse download response")
    }
}
