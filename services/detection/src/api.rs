use crate::config::ApiConfig;
use crate::error::DetectError;
use crate::orchestrator::{DetectionResponse, Orchestrator};
use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Header carrying the authenticated user id, set by the auth gateway
pub const USER_ID_HEADER: &str = "x-user-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Pool probed by the readiness check; absent when running without a database
    pub db_pool: Option<PgPool>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

/// HTTP status for each failure kind
pub fn status_for(err: &DetectError) -> StatusCode {
    match err {
        DetectError::ImageNotFound(_) => StatusCode::NOT_FOUND,
        DetectError::NotAuthorized { .. } => StatusCode::FORBIDDEN,
        DetectError::ArtifactMissing { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        DetectError::MalformedArtifact(_)
        | DetectError::BackendRejected { .. }
        | DetectError::BackendUnavailable(_)
        | DetectError::DetectionUnavailable { .. } => StatusCode::BAD_GATEWAY,
        DetectError::PersistenceFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        DetectError::Lookup(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for DetectError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            error!(code = self.code(), error = %self, "Detection request failed");
        }
        (status, Json(ErrorResponse::new(self.to_string(), self.code()))).into_response()
    }
}

/// Authenticated caller, read from [`USER_ID_HEADER`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestingUser(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for RequestingUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .map(RequestingUser)
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(ErrorResponse::new(
                        "Missing or invalid user identity",
                        "UNAUTHENTICATED",
                    )),
                )
            })
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let layout = state.orchestrator.layout();
    let annotated_route = layout.public_url(&layout.annotated_relative(""));
    let annotated_files = ServeDir::new(layout.annotated_root());

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/images/:image_id/detect", post(run_detection))
        .route("/api/images/:image_id/detections", get(get_detections))
        .nest_service(annotated_route.trim_end_matches('/'), annotated_files)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "detection-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(pool) = state.db_pool.as_ref() else {
        return (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "not_configured"
            })),
        );
    };

    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Run detection on an image
#[instrument(skip(state))]
async fn run_detection(
    State(state): State<AppState>,
    Path(image_id): Path<i64>,
    RequestingUser(user_id): RequestingUser,
) -> Result<Json<DetectionResponse>, DetectError> {
    let response = state.orchestrator.run_detection(image_id, user_id).await?;
    Ok(Json(response))
}

/// Current detections of an image
#[instrument(skip(state))]
async fn get_detections(
    State(state): State<AppState>,
    Path(image_id): Path<i64>,
    RequestingUser(user_id): RequestingUser,
) -> Result<Json<DetectionResponse>, DetectError> {
    let response = state.orchestrator.current_detections(image_id, user_id).await?;
    Ok(Json(response))
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting detection API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection_client::BackendError;
    use crate::store::StoreError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&DetectError::ImageNotFound(1)), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&DetectError::NotAuthorized {
                image_id: 1,
                user_id: 2
            }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&DetectError::DetectionUnavailable {
                attempts: 3,
                source: BackendError::Unavailable("timeout".to_string()),
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&DetectError::PersistenceFailed(StoreError::ImageVanished(1))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_shape() {
        let body = serde_json::to_value(ErrorResponse::new("Image 1 not found", "IMAGE_NOT_FOUND"))
            .unwrap();
        assert_eq!(body["code"], "IMAGE_NOT_FOUND");
        assert_eq!(body["error"], "Image 1 not found");
    }
}
