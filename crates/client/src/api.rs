//! REST API client for the scanlation backend.
//!
//! Wraps the backend HTTP endpoints (page submission, job status, legacy
//! upload, health) using [`reqwest`], and implements [`JobStatusSource`]
//! so a [`ScanlateApi`] can drive a [`JobPoller`](crate::poller::JobPoller).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use scanlate_core::job::{JobSnapshot, ProcessMode};
use scanlate_core::types::JobId;
use serde::Deserialize;

use crate::config::ApiConfig;

/// Anything that can answer "what is the status of job X right now".
///
/// Must be safe to call repeatedly for the same job.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn fetch_status(&self, job_id: &str) -> Result<JobSnapshot, ApiError>;
}

/// HTTP client for a single backend instance.
pub struct ScanlateApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by `POST /process` after queuing a page.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier to poll.
    pub job_id: JobId,
    pub status: String,
}

/// Response returned by the legacy `POST /upload` endpoint.
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub filename: String,
    pub url: String,
}

/// Response returned by `GET /`.
#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Options for [`ScanlateApi::submit_page`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub mode: ProcessMode,
    /// Attach the processed page to an existing project.
    pub project_id: Option<String>,
}

/// Errors from the REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, decode).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Scanlate API error ({status}): {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The backend has no record of the job.
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// The configured base URL cannot carry a job path.
    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),

    /// The local file cannot be submitted.
    #[error("Invalid file: {0}")]
    InvalidFile(String),

    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanlateApi {
    /// Create a new API client.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://localhost:8000`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    /// Build a client honouring the configured request timeout.
    pub fn from_config(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(client, config.api_url.clone()))
    }

    /// Base HTTP API URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Check that the backend is reachable.
    pub async fn health(&self) -> Result<HealthResponse, ApiError> {
        let response = self.client.get(format!("{}/", self.api_url)).send().await?;
        Self::parse_response(response).await
    }

    /// Read the current status of a job.
    ///
    /// The backend answers `null` for unknown ids, which is reported as
    /// [`ApiError::JobNotFound`].
    pub async fn get_job(&self, job_id: &str) -> Result<JobSnapshot, ApiError> {
        let response = self.client.get(self.job_url(job_id)?).send().await?;

        let snapshot: Option<JobSnapshot> = Self::parse_response(response).await?;
        snapshot.ok_or_else(|| ApiError::JobNotFound(job_id.to_string()))
    }

    /// Submit a page image for processing.
    ///
    /// Sends a multipart `POST /process` and returns the job id to poll.
    pub async fn submit_page(
        &self,
        path: &Path,
        options: &SubmitOptions,
    ) -> Result<SubmitResponse, ApiError> {
        let mut form = reqwest::multipart::Form::new()
            .part("file", Self::image_part(path).await?)
            .text("mode", options.mode.as_str());

        if let Some(project_id) = &options.project_id {
            form = form.text("project_id", project_id.clone());
        }

        let response = self
            .client
            .post(format!("{}/process", self.api_url))
            .multipart(form)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::parse_response(response).await?;

        tracing::info!(
            job_id = %submitted.job_id,
            mode = %options.mode,
            file = %path.display(),
            "Page submitted for processing",
        );

        Ok(submitted)
    }

    /// Upload an image without processing it.
    pub async fn upload_image(&self, path: &Path) -> Result<UploadResponse, ApiError> {
        let form = reqwest::multipart::Form::new().part("file", Self::image_part(path).await?);

        let response = self
            .client
            .post(format!("{}/upload", self.api_url))
            .multipart(form)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    /// `{api_url}/jobs/{job_id}` with the id percent-encoded as a single
    /// path segment.
    fn job_url(&self, job_id: &str) -> Result<reqwest::Url, ApiError> {
        let mut url = reqwest::Url::parse(&self.api_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {e}", self.api_url)))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.api_url.clone()))?
            .pop_if_empty()
            .push("jobs")
            .push(job_id);
        Ok(url)
    }

    /// Read an image file into a multipart part with the right MIME type.
    async fn image_part(path: &Path) -> Result<reqwest::multipart::Part, ApiError> {
        let mime = image_mime_type(path)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ApiError::InvalidFile(format!("{} has no file name", path.display())))?
            .to_string();

        let bytes = tokio::fs::read(path).await?;
        Ok(reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)?)
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ApiError::Status`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            tracing::error!(status = status.as_u16(), body = %body, "Scanlate API error");
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl JobStatusSource for ScanlateApi {
    async fn fetch_status(&self, job_id: &str) -> Result<JobSnapshot, ApiError> {
        self.get_job(job_id).await
    }
}

/// MIME type for a page image, inferred from its extension.
///
/// The backend rejects anything that is not `image/*`, so other files are
/// refused before any bytes are read.
pub fn image_mime_type(path: &Path) -> Result<&'static str, ApiError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => Ok("image/png"),
        "jpg" | "jpeg" => Ok("image/jpeg"),
        "webp" => Ok("image/webp"),
        "gif" => Ok("image/gif"),
        "bmp" => Ok("image/bmp"),
        _ => Err(ApiError::InvalidFile(format!(
            "{} is not a supported image (png, jpg, jpeg, webp, gif, bmp)",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_type_from_extension() {
        assert_eq!(image_mime_type(Path::new("page.PNG")).unwrap(), "image/png");
        assert_eq!(image_mime_type(Path::new("a/b/page.jpeg")).unwrap(), "image/jpeg");
        assert_eq!(image_mime_type(Path::new("page.webp")).unwrap(), "image/webp");
    }

    #[test]
    fn non_images_are_rejected() {
        assert!(matches!(
            image_mime_type(Path::new("chapter.zip")),
            Err(ApiError::InvalidFile(_))
        ));
        assert!(matches!(
            image_mime_type(Path::new("no_extension")),
            Err(ApiError::InvalidFile(_))
        ));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let api = ScanlateApi::new("http://localhost:8000/");
        assert_eq!(api.api_url(), "http://localhost:8000");
    }

    #[test]
    fn job_id_is_a_single_encoded_segment() {
        let api = ScanlateApi::new("http://localhost:8000");
        assert_eq!(
            api.job_url("abc#frag").unwrap().as_str(),
            "http://localhost:8000/jobs/abc%23frag"
        );
        assert_eq!(
            api.job_url("a/b?x=1").unwrap().as_str(),
            "http://localhost:8000/jobs/a%2Fb%3Fx=1"
        );
    }

    #[test]
    fn job_url_keeps_base_path() {
        let api = ScanlateApi::new("http://gateway.local/scanlate/");
        assert_eq!(
            api.job_url("job-1").unwrap().as_str(),
            "http://gateway.local/scanlate/jobs/job-1"
        );
    }

    #[test]
    fn unparsable_base_url_is_reported() {
        let api = ScanlateApi::new("not a url");
        assert!(matches!(api.job_url("job-1"), Err(ApiError::InvalidUrl(_))));
    }
}
