use crate::artifact::ArtifactError;
use crate::detection_client::BackendError;
use crate::retry::RetryExhausted;
use crate::store::StoreError;
use thiserror::Error;

/// Failures of a detection run, each with a stable machine-readable code.
///
/// A run never returns `MalformedArtifact`, `BackendRejected` or
/// `BackendUnavailable` on its own: backend failures surface wrapped in
/// `DetectionUnavailable`, and a bad annotated payload is reported as
/// [`crate::orchestrator::ArtifactWarning`]. The standalone kinds exist for
/// callers converting a single [`BackendError`] or [`ArtifactError`].
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("Image {0} not found")]
    ImageNotFound(i64),

    #[error("Image file not found on storage: {path}")]
    ArtifactMissing { path: String },

    #[error("User {user_id} is not authorized for image {image_id}")]
    NotAuthorized { image_id: i64, user_id: i64 },

    #[error(transparent)]
    MalformedArtifact(#[from] ArtifactError),

    #[error("Detection backend rejected the request with status {status}")]
    BackendRejected { status: u16 },

    #[error("Detection backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Detection unavailable after {attempts} attempt(s): {source}")]
    DetectionUnavailable {
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("Failed to persist detections: {0}")]
    PersistenceFailed(#[source] StoreError),

    #[error("Failed to look up image: {0}")]
    Lookup(#[source] StoreError),
}

impl DetectError {
    /// Stable code for API clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::ImageNotFound(_) => "IMAGE_NOT_FOUND",
            Self::ArtifactMissing { .. } => "ARTIFACT_MISSING",
            Self::NotAuthorized { .. } => "NOT_AUTHORIZED",
            Self::MalformedArtifact(_) => "MALFORMED_ARTIFACT",
            Self::BackendRejected { .. } => "BACKEND_REJECTED",
            Self::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Self::DetectionUnavailable { .. } => "DETECTION_UNAVAILABLE",
            Self::PersistenceFailed(_) => "PERSISTENCE_FAILED",
            Self::Lookup(_) => "STORE_UNAVAILABLE",
        }
    }

    /// True for failures decided locally, before any backend call
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::ImageNotFound(_) | Self::ArtifactMissing { .. } | Self::NotAuthorized { .. }
        )
    }
}

impl From<BackendError> for DetectError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Rejected { status } => Self::BackendRejected { status },
            BackendError::Unavailable(reason) => Self::BackendUnavailable(reason),
        }
    }
}

impl From<RetryExhausted<BackendError>> for DetectError {
    fn from(e: RetryExhausted<BackendError>) -> Self {
        Self::DetectionUnavailable {
            attempts: e.attempts,
            source: e.last_error,
        }
    }
}
