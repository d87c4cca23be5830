//! Detection run orchestration.
//!
//! One run: look up the image, check ownership, read the file, then (holding
//! the image's run guard) submit it through the retry policy, store the
//! annotated artifact and replace the image's detections.

use crate::artifact;
use crate::config::StorageConfig;
use crate::detection_client::DetectionBackend;
use crate::error::DetectError;
use crate::guard::ImageLocks;
use crate::models::{DetectionRecord, NewDetection};
use crate::retry::RetryPolicy;
use crate::store::DetectionStore;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Result of a run, or the current state of an image's detections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub image_id: i64,
    pub detections: Vec<DetectionRecord>,
    /// Public URL of the annotated artifact, if one was stored
    pub annotated_url: Option<String>,
    /// Set when the backend sent an annotated image that could not be kept
    pub annotated_warning: Option<ArtifactWarning>,
}

/// Why an annotated image sent by the backend is missing from the response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactWarning {
    /// Payload was not valid base64
    MalformedArtifact,
    /// Decoded image could not be written to storage
    WriteFailed,
}

/// Where uploads live on disk and how they are addressed publicly
#[derive(Debug, Clone)]
pub struct StorageLayout {
    upload_root: PathBuf,
    annotated_dir: String,
    public_url_prefix: String,
}

impl StorageLayout {
    /// A relative `upload_root` is anchored at the current directory
    pub fn new(
        upload_root: impl Into<PathBuf>,
        annotated_dir: impl Into<String>,
        public_url_prefix: impl Into<String>,
    ) -> Self {
        Self {
            upload_root: anchor(upload_root.into()),
            annotated_dir: annotated_dir.into(),
            public_url_prefix: public_url_prefix.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            config.upload_root.clone(),
            config.annotated_dir.clone(),
            config.public_url_prefix.clone(),
        )
    }

    pub fn upload_root(&self) -> &Path {
        &self.upload_root
    }

    /// Directory holding annotated artifacts
    pub fn annotated_root(&self) -> PathBuf {
        self.upload_root.join(&self.annotated_dir)
    }

    /// Resolve a stored image path to a file under the upload root.
    ///
    /// Absolute paths inside the root are kept. Everything else, including
    /// the public form `/uploads/<user>/<file>`, is taken relative to the
    /// root. Returns `None` for paths that would escape the root.
    pub fn resolve(&self, stored: &str) -> Option<PathBuf> {
        let stored_path = Path::new(stored);

        let (base, relative) = if stored_path.is_absolute() && stored_path.starts_with(&self.upload_root) {
            (self.upload_root.clone(), stored_path.strip_prefix(&self.upload_root).ok()?)
        } else {
            let without_prefix = self.strip_public_prefix(stored);
            (
                self.upload_root.clone(),
                Path::new(without_prefix.trim_start_matches('/')),
            )
        };

        let mut resolved = base;
        let mut depth = 0;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                _ => return None,
            }
        }

        (depth > 0).then_some(resolved)
    }

    /// Path of an annotated artifact relative to the upload root
    pub fn annotated_relative(&self, file_name: &str) -> String {
        format!("{}/{}", self.annotated_dir.trim_end_matches('/'), file_name)
    }

    /// Absolute location of a root-relative path
    pub fn absolute(&self, relative: &str) -> PathBuf {
        self.upload_root.join(relative)
    }

    /// Public URL of a root-relative path
    pub fn public_url(&self, relative: &str) -> String {
        format!(
            "{}/{}",
            self.public_url_prefix.trim_end_matches('/'),
            relative.trim_start_matches('/')
        )
    }

    fn strip_public_prefix<'a>(&self, stored: &'a str) -> &'a str {
        let prefix = self.public_url_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return stored;
        }
        match stored.strip_prefix(prefix) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => stored,
        }
    }
}

fn anchor(root: PathBuf) -> PathBuf {
    if root.is_absolute() {
        return root;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(root),
        Err(e) => {
            warn!(root = %root.display(), error = %e, "Cannot anchor relative upload root");
            root
        }
    }
}

/// Drives detection runs for stored images
pub struct Orchestrator {
    store: Arc<dyn DetectionStore>,
    backend: Arc<dyn DetectionBackend>,
    retry: RetryPolicy,
    layout: StorageLayout,
    locks: ImageLocks,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DetectionStore>,
        backend: Arc<dyn DetectionBackend>,
        retry: RetryPolicy,
        layout: StorageLayout,
    ) -> Self {
        Self {
            store,
            backend,
            retry,
            layout,
            locks: ImageLocks::new(),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Run detection on `image_id` on behalf of `user_id`.
    #[instrument(skip(self))]
    pub async fn run_detection(
        &self,
        image_id: i64,
        user_id: i64,
    ) -> Result<DetectionResponse, DetectError> {
        let result = self.run(image_id, user_id).await;
        match &result {
            Ok(_) => metrics::counter!("detection.runs.succeeded").increment(1),
            Err(e) => {
                let stage = if e.is_precondition() { "precondition" } else { "pipeline" };
                metrics::counter!("detection.runs.failed", "code" => e.code(), "stage" => stage)
                    .increment(1);
            }
        }
        result
    }

    async fn run(&self, image_id: i64, user_id: i64) -> Result<DetectionResponse, DetectError> {
        let image = self
            .store
            .find_image(image_id)
            .await
            .map_err(DetectError::Lookup)?
            .ok_or(DetectError::ImageNotFound(image_id))?;

        if image.user_id != user_id {
            warn!(owner_id = image.user_id, "Detection requested by non-owner");
            return Err(DetectError::NotAuthorized { image_id, user_id });
        }

        let path = self
            .layout
            .resolve(&image.path)
            .ok_or_else(|| DetectError::ArtifactMissing {
                path: image.path.clone(),
            })?;

        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            warn!(path = %path.display(), error = %e, "Image file unreadable");
            DetectError::ArtifactMissing {
                path: path.display().to_string(),
            }
        })?;

        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&image.filename)
            .to_string();

        let guard = self.locks.acquire(image_id).await;
        let active = self.locks.active();
        metrics::gauge!("detection.runs.active_images").set(active as f64);
        debug!(image_id = guard.image_id(), active_images = active, "Run guard acquired");

        let started = Instant::now();
        let backend = &self.backend;
        let (bytes, filename) = (&bytes, &filename);
        let outcome = self
            .retry
            .call(|attempt| async move {
                metrics::counter!("detection.backend.attempts").increment(1);
                debug!(attempt = attempt, "Submitting image to detection backend");
                let result = backend.submit(bytes, filename, image_id).await;
                if result.is_err() {
                    metrics::counter!("detection.backend.failures").increment(1);
                }
                result
            })
            .await;
        let backend_latency = started.elapsed();
        metrics::histogram!("detection.backend.duration_seconds").record(backend_latency.as_secs_f64());

        let run = outcome.map_err(|e| {
            error!(
                attempts = e.attempts,
                elapsed_ms = backend_latency.as_millis() as u64,
                error = %e.last_error,
                "Detection backend failed on every attempt"
            );
            DetectError::from(e)
        })?;

        // An empty payload means no annotated image
        let (annotated_path, annotated_warning) = match run.annotated_image_base64.as_deref() {
            Some(payload) if !payload.trim().is_empty() => {
                self.store_artifact(image_id, payload).await
            }
            _ => (None, None),
        };

        let new_detections: Vec<NewDetection> = run.detections.iter().map(NewDetection::from).collect();

        // The artifact file is already written; it stays behind if this fails
        let detections = self
            .store
            .replace_detections(image_id, &new_detections, annotated_path.as_deref())
            .await
            .map_err(|e| {
                error!(
                    error = %e,
                    annotated_path = ?annotated_path,
                    "Failed to persist detections"
                );
                DetectError::PersistenceFailed(e)
            })?;

        info!(
            detection_count = detections.len(),
            elapsed_ms = backend_latency.as_millis() as u64,
            annotated = annotated_path.is_some(),
            "Detection run completed"
        );

        Ok(DetectionResponse {
            image_id,
            detections,
            annotated_url: annotated_path.map(|p| self.layout.public_url(&p)),
            annotated_warning,
        })
    }

    /// Current detections and annotated URL of an image owned by `user_id`
    #[instrument(skip(self))]
    pub async fn current_detections(
        &self,
        image_id: i64,
        user_id: i64,
    ) -> Result<DetectionResponse, DetectError> {
        let image = self
            .store
            .find_image(image_id)
            .await
            .map_err(DetectError::Lookup)?
            .ok_or(DetectError::ImageNotFound(image_id))?;

        if image.user_id != user_id {
            return Err(DetectError::NotAuthorized { image_id, user_id });
        }

        let detections = self
            .store
            .list_detections(image_id)
            .await
            .map_err(DetectError::Lookup)?;

        Ok(DetectionResponse {
            image_id,
            detections,
            annotated_url: image.annotated_path.map(|p| self.layout.public_url(&p)),
            annotated_warning: None,
        })
    }

    /// Decode and write the annotated image; returns its root-relative path
    async fn store_artifact(
        &self,
        image_id: i64,
        payload: &str,
    ) -> (Option<String>, Option<ArtifactWarning>) {
        let decoded = match artifact::decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "Discarding malformed annotated image");
                metrics::counter!("detection.artifacts.malformed").increment(1);
                return (None, Some(ArtifactWarning::MalformedArtifact));
            }
        };

        let file_name = format!(
            "annotated-{}-{}.{}",
            image_id,
            Uuid::new_v4(),
            decoded.extension
        );
        let relative = self.layout.annotated_relative(&file_name);
        let absolute = self.layout.absolute(&relative);

        if let Err(e) = write_artifact(&absolute, &decoded.bytes).await {
            warn!(path = %absolute.display(), error = %e, "Failed to write annotated image");
            return (None, Some(ArtifactWarning::WriteFailed));
        }

        debug!(path = %absolute.display(), size_bytes = decoded.bytes.len(), "Annotated image stored");
        (Some(relative), None)
    }
}

async fn write_artifact(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await
}
