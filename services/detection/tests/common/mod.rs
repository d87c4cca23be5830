//! Shared fixtures: a fake detection backend over HTTP, a scripted in-process
//! backend, and an upload root seeded with image 42 owned by user 7.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use detection_service::{
    BackendError, DetectionBackend, DetectionRunResult, ImageRecord, InMemoryStore,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Base64 of a 1x1 PNG
pub const PIXEL_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

pub const IMAGE_ID: i64 = 42;
pub const OWNER_ID: i64 = 7;
pub const IMAGE_BYTES: &[u8] = b"\xff\xd8\xff\xe0 fake jpeg";

/// The canonical backend answer: one car plus a PNG data URL
pub fn car_payload() -> serde_json::Value {
    serde_json::json!({
        "annotated_image_base64": format!("data:image/png;base64,{PIXEL_PNG_BASE64}"),
        "detections": [
            {"class": "car", "x": 10, "y": 10, "w": 50, "h": 40, "confidence": 0.91}
        ]
    })
}

pub fn car_result() -> DetectionRunResult {
    serde_json::from_value(car_payload()).expect("valid payload")
}

/// Upload root with image 42 (owner 7) stored as `/uploads/7/photo.jpg`
pub fn seeded_store() -> (Arc<InMemoryStore>, TempDir) {
    let root = TempDir::new().expect("Failed to create upload root");
    write_image(root.path());

    let store = Arc::new(InMemoryStore::new());
    store.insert_image(ImageRecord {
        id: IMAGE_ID,
        user_id: OWNER_ID,
        filename: "photo.jpg".to_string(),
        path: "/uploads/7/photo.jpg".to_string(),
        annotated_path: None,
        created_at: Utc::now(),
    });

    (store, root)
}

pub fn write_image(root: &Path) {
    std::fs::create_dir_all(root.join("7")).expect("Failed to create user dir");
    std::fs::write(root.join("7/photo.jpg"), IMAGE_BYTES).expect("Failed to write image");
}

/// How the fake HTTP backend answers
#[derive(Debug, Clone)]
pub enum Behaviour {
    Respond(serde_json::Value),
    Status(u16),
    Garbage,
    Hang(Duration),
}

/// What the fake backend saw in one request
#[derive(Debug, Clone, Default)]
pub struct Received {
    pub image: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub image_id: Option<String>,
}

#[derive(Clone)]
struct FakeState {
    behaviour: Behaviour,
    hits: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Received>>>,
}

/// A detection backend listening on a local port
pub struct FakeBackend {
    pub url: String,
    hits: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Received>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeBackend {
    pub async fn spawn(behaviour: Behaviour) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let state = FakeState {
            behaviour,
            hits: hits.clone(),
            received: received.clone(),
        };

        let router = Router::new()
            .route("/detect", post(detect))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake backend");
        let addr = listener.local_addr().expect("local addr");

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self {
            url: format!("http://{addr}/detect"),
            hits,
            received,
            handle,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().clone()
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn detect(State(state): State<FakeState>, mut multipart: Multipart) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);

    let mut received = Received::default();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") => {
                received.filename = field.file_name().map(str::to_string);
                received.content_type = field.content_type().map(str::to_string);
                received.image = field.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            }
            Some("image_id") => {
                received.image_id = field.text().await.ok();
            }
            _ => {}
        }
    }
    state.received.lock().push(received);

    match state.behaviour {
        Behaviour::Respond(body) => Json(body).into_response(),
        Behaviour::Status(code) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, "backend failure").into_response()
        }
        Behaviour::Garbage => (StatusCode::OK, "<html>not json</html>").into_response(),
        Behaviour::Hang(delay) => {
            tokio::time::sleep(delay).await;
            Json(car_payload()).into_response()
        }
    }
}

/// URL on which nothing listens
pub async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}/detect")
}

/// In-process backend replaying scripted results, tracking overlap
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<DetectionRunResult, BackendError>>>,
    fallback: Result<DetectionRunResult, BackendError>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    pub fn always(result: Result<DetectionRunResult, BackendError>) -> Self {
        Self::sequence(Vec::new(), result)
    }

    pub fn sequence(
        script: Vec<Result<DetectionRunResult, BackendError>>,
        fallback: Result<DetectionRunResult, BackendError>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DetectionBackend for ScriptedBackend {
    async fn submit(
        &self,
        _image: &[u8],
        _filename: &str,
        _image_id: i64,
    ) -> Result<DetectionRunResult, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
