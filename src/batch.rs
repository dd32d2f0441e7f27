use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PipelineError;

/// One line of the newline-delimited batch input file. The shape is the
/// external service's wire contract and must not drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequestLine {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: ChatCompletionBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_completion_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

impl ResponseFormat {
    pub fn json_object() -> Self {
        Self {
            format_type: "json_object".to_string(),
        }
    }
}

/// One line of a completed batch's output (or error) file.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchOutputLine {
    pub custom_id: String,
    #[serde(default)]
    pub response: Option<BatchResponse>,
    #[serde(default)]
    pub error: Option<BatchErrorPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchResponse {
    pub status_code: u16,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub body: Option<ChatCompletionReply>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionReply {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ChatReplyMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatReplyMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchErrorPayload {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    Queued,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    /// Unknown statuses are treated as still-running so an operator can
    /// keep observing a job the client predates.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Expired | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub status: BatchStatus,
    #[serde(default)]
    pub request_counts: Option<RequestCounts>,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    #[serde(default)]
    pub errors: Option<serde_json::Value>,
}

impl BatchJob {
    pub fn errors_summary(&self) -> String {
        self.errors
            .as_ref()
            .map(|value| value.to_string())
            .unwrap_or_else(|| "no error detail reported".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

/// Blocking client for the external asynchronous batch-completion
/// service. The pipeline is sequential; the only waiting is the coarse
/// poll loop below.
pub struct BatchClient {
    base_url: String,
    api_key: String,
    http: reqwest::blocking::Client,
}

impl BatchClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(600))
            .build()
            .context("failed to build batch service http client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        })
    }

    pub fn upload_batch_file(&self, path: &Path) -> Result<String> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read batch input: {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "batch_input.jsonl".to_string());

        let form = reqwest::blocking::multipart::Form::new()
            .text("purpose", "batch")
            .part(
                "file",
                reqwest::blocking::multipart::Part::bytes(bytes).file_name(file_name),
            );

        let response = self
            .http
            .post(format!("{}/v1/files", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .context("batch file upload request failed")?;

        let file: FileObject = Self::checked(response)?
            .json()
            .context("failed to decode file upload response")?;

        Ok(file.id)
    }

    pub fn create_batch(
        &self,
        input_file_id: &str,
        kind_label: &str,
        model_key: &str,
    ) -> Result<BatchJob> {
        let body = serde_json::json!({
            "input_file_id": input_file_id,
            "endpoint": "/v1/chat/completions",
            "completion_window": "24h",
            "metadata": {
                "model_key": model_key,
                "type": kind_label,
            },
        });

        let response = self
            .http
            .post(format!("{}/v1/batches", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .context("batch create request failed")?;

        let job: BatchJob = Self::checked(response)?
            .json()
            .context("failed to decode batch create response")?;

        Ok(job)
    }

    pub fn retrieve_batch(&self, job_id: &str) -> Result<BatchJob> {
        let response = self
            .http
            .get(format!("{}/v1/batches/{job_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .with_context(|| format!("batch status request failed for {job_id}"))?;

        let job: BatchJob = Self::checked(response)?
            .json()
            .context("failed to decode batch status response")?;

        Ok(job)
    }

    pub fn download_file(&self, file_id: &str) -> Result<String> {
        let response = self
            .http
            .get(format!("{}/v1/files/{file_id}/content", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .with_context(|| format!("file download request failed for {file_id}"))?;

        Self::checked(response)?
            .text()
            .with_context(|| format!("failed to read file content for {file_id}"))
    }

    /// Poll until the job reaches a terminal status, logging progress at
    /// every tick. Safe to abandon: the job runs on independently and can
    /// be re-polled later from the persisted job id.
    pub fn poll_until_terminal(&self, job_id: &str, interval: Duration) -> Result<BatchJob> {
        loop {
            let job = self.retrieve_batch(job_id)?;
            log_job_progress(&job);

            if job.status.is_terminal() {
                return Ok(job);
            }

            std::thread::sleep(interval);
        }
    }

    fn checked(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().unwrap_or_default();

        if status.as_u16() == 429 {
            return Err(PipelineError::RateLimited(body).into());
        }
        if body.contains("insufficient_quota") || body.contains("billing") {
            return Err(PipelineError::BillingLimitReached(body).into());
        }

        bail!("batch service returned {status}: {body}");
    }
}

pub fn log_job_progress(job: &BatchJob) {
    let counts = job.request_counts.unwrap_or_default();
    let progress_pct = if counts.total > 0 {
        counts.completed as f64 / counts.total as f64 * 100.0
    } else {
        0.0
    };

    info!(
        job_id = %job.id,
        status = job.status.as_str(),
        completed = counts.completed,
        failed = counts.failed,
        total = counts.total,
        progress_pct = format!("{progress_pct:.1}"),
        "batch job status"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_matches_wire_contract() {
        let line = BatchRequestLine {
            custom_id: "node_42_1.2.3".to_string(),
            method: "POST".to_string(),
            url: "/v1/chat/completions".to_string(),
            body: ChatCompletionBody {
                model: "gpt-5".to_string(),
                messages: vec![ChatMessage {
                    role: "user".to_string(),
                    content: "hello".to_string(),
                }],
                max_completion_tokens: 8000,
                temperature: Some(1.0),
                response_format: None,
            },
        };

        let value = serde_json::to_value(&line).expect("serialize");
        assert_eq!(value["custom_id"], "node_42_1.2.3");
        assert_eq!(value["method"], "POST");
        assert_eq!(value["url"], "/v1/chat/completions");
        assert_eq!(value["body"]["max_completion_tokens"], 8000);
        assert!(value["body"].get("response_format").is_none());
    }

    #[test]
    fn json_response_format_is_rendered_as_type_object() {
        let format = ResponseFormat::json_object();
        let value = serde_json::to_value(&format).expect("serialize");
        assert_eq!(value["type"], "json_object");
    }

    #[test]
    fn output_line_with_error_payload_decodes() {
        let raw = r#"{"custom_id":"usecases_node_7_1.1.1","error":{"code":"rate_limit_exceeded","message":"slow down"}}"#;
        let line: BatchOutputLine = serde_json::from_str(raw).expect("decode");

        assert_eq!(line.custom_id, "usecases_node_7_1.1.1");
        assert!(line.response.is_none());
        let error = line.error.expect("error payload");
        assert_eq!(error.code.as_deref(), Some("rate_limit_exceeded"));
    }

    #[test]
    fn statuses_classify_terminal_states() {
        for status in [
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Expired,
            BatchStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
        }
        for status in [
            BatchStatus::Validating,
            BatchStatus::Queued,
            BatchStatus::InProgress,
            BatchStatus::Finalizing,
            BatchStatus::Cancelling,
            BatchStatus::Unknown,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn unrecognized_status_maps_to_unknown() {
        let raw = r#"{"id":"batch_x","status":"paused_for_review"}"#;
        let job: BatchJob = serde_json::from_str(raw).expect("decode");
        assert_eq!(job.status, BatchStatus::Unknown);
        assert!(!job.status.is_terminal());
    }
}
