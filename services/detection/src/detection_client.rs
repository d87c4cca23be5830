//! Single-attempt client for the external detection backend.
//!
//! One call posts the image as multipart form data and parses the JSON
//! result. Retrying is left to [`crate::retry::RetryPolicy`].

use crate::config::BackendConfig;
use crate::models::DetectionRunResult;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument};

/// Failures of a single backend call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Detection backend rejected the request with status {status}")]
    Rejected { status: u16 },

    #[error("Detection backend unavailable: {0}")]
    Unavailable(String),
}

/// A service that runs object detection on one image.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DetectionBackend: Send + Sync {
    /// Submit one image and return the parsed detection result.
    async fn submit(
        &self,
        image: &[u8],
        filename: &str,
        image_id: i64,
    ) -> Result<DetectionRunResult, BackendError>;
}

/// HTTP implementation of [`DetectionBackend`]
pub struct HttpDetectionClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpDetectionClient {
    /// Create a client for the configured endpoint
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        Self::with_timeouts(
            config.endpoint.clone(),
            config.timeout(),
            config.connect_timeout(),
        )
    }

    /// Create a client with explicit per-request and connect timeouts
    pub fn with_timeouts(
        endpoint: impl Into<String>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| BackendError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_form(&self, image: &[u8], filename: &str, image_id: i64) -> Result<Form, BackendError> {
        let part = Part::bytes(image.to_vec())
            .file_name(filename.to_string())
            .mime_str(content_type_for(filename))
            .map_err(|e| BackendError::Unavailable(format!("invalid image part: {e}")))?;

        Ok(Form::new()
            .part("image", part)
            .text("image_id", image_id.to_string()))
    }

    fn classify(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Unavailable(format!("request timed out after {:?}", self.timeout))
        } else if err.is_connect() {
            BackendError::Unavailable(format!("connection failed: {err}"))
        } else if err.is_decode() {
            BackendError::Unavailable(format!("malformed response body: {err}"))
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }
}

#[async_trait]
impl DetectionBackend for HttpDetectionClient {
    #[instrument(skip(self, image), fields(endpoint = %self.endpoint, size_bytes = image.len()))]
    async fn submit(
        &self,
        image: &[u8],
        filename: &str,
        image_id: i64,
    ) -> Result<DetectionRunResult, BackendError> {
        let form = self.build_form(image, filename, image_id)?;
        let started = Instant::now();

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Rejected {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        let result: DetectionRunResult = serde_json::from_slice(&body)
            .map_err(|e| BackendError::Unavailable(format!("malformed response body: {e}")))?;

        debug!(
            image_id = image_id,
            detection_count = result.detections.len(),
            has_annotated = result.annotated_image_base64.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Detection backend responded"
        );

        Ok(result)
    }
}

/// Get content type for an image filename
fn content_type_for(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}
