//! Detection Service
//!
//! Runs uploaded images through an external object-detection backend and
//! keeps each image's detection set in PostgreSQL.
//!
//! ## Features
//!
//! - **Retrying Backend Calls**: multipart submission to the model service,
//!   bounded attempts with linear backoff
//! - **Annotated Artifacts**: base64/data-URL payloads decoded and stored
//!   under the upload root
//! - **Atomic Replacement**: an image's detections are swapped in a single
//!   transaction, one run per image at a time
//!
//! ## Architecture
//!
//! ```text
//!   POST /api/images/:id/detect
//!              │
//!              ▼
//!       ┌──────────────┐   lookup / ownership / file
//!       │ Orchestrator │──────────────────────────────┐
//!       └──────────────┘                              │
//!              │ per-image guard                      │
//!              ▼                                      ▼
//!       ┌──────────────┐   ┌──────────────┐    ┌──────────────┐
//!       │ Retry Policy │──▶│ Detection    │    │ Store        │
//!       └──────────────┘   │ Client       │    │ (PostgreSQL) │
//!                          └──────────────┘    └──────────────┘
//!                                 │                   ▲
//!                                 ▼                   │
//!                          ┌──────────────┐    replace detections
//!                          │ Artifact     │───────────┘
//!                          │ Codec        │
//!                          └──────────────┘
//! ```

pub mod api;
pub mod artifact;
pub mod config;
pub mod detection_client;
pub mod error;
pub mod guard;
pub mod models;
pub mod orchestrator;
pub mod pg_store;
pub mod retry;
pub mod store;

pub use api::{create_router, AppState, ErrorResponse};
pub use config::Config;
pub use detection_client::{BackendError, DetectionBackend, HttpDetectionClient};
pub use error::DetectError;
pub use guard::ImageLocks;
pub use models::{
    BackendDetection, Confidence, DetectionRecord, DetectionRunResult, ImageRecord, NewDetection,
};
pub use orchestrator::{ArtifactWarning, DetectionResponse, Orchestrator, StorageLayout};
pub use pg_store::PgStore;
pub use retry::{RetryExhausted, RetryPolicy};
pub use store::{DetectionStore, InMemoryStore, StoreError};
