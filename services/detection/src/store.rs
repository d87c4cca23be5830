//! Persistence seam for images and their detection sets.
//!
//! [`DetectionStore::replace_detections`] is the detection persister: it
//! swaps an image's detections and records its annotated artifact as one
//! atomic unit. [`crate::pg_store::PgStore`] is the production
//! implementation; [`InMemoryStore`] keeps the same semantics in process.

use crate::models::{DetectionRecord, ImageRecord, NewDetection};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Errors raised by a detection store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Image {0} no longer exists")]
    ImageVanished(i64),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Access to images and their detections
#[async_trait]
pub trait DetectionStore: Send + Sync {
    /// Load one image row
    async fn find_image(&self, image_id: i64) -> Result<Option<ImageRecord>, StoreError>;

    /// Current detection set of an image, in insertion order
    async fn list_detections(&self, image_id: i64) -> Result<Vec<DetectionRecord>, StoreError>;

    /// Atomically replace an image's detections.
    ///
    /// Deletes every existing detection of the image, inserts `detections`
    /// (possibly none) and, when `annotated_path` is given, records it on the
    /// image. Either all three steps take effect or none does.
    async fn replace_detections(
        &self,
        image_id: i64,
        detections: &[NewDetection],
        annotated_path: Option<&str>,
    ) -> Result<Vec<DetectionRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    images: HashMap<i64, ImageRecord>,
    detections: Vec<DetectionRecord>,
    next_detection_id: i64,
}

/// Process-local store for tests and database-less runs
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    fail_replacements: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite an image row
    pub fn insert_image(&self, image: ImageRecord) {
        self.state.lock().images.insert(image.id, image);
    }

    /// Snapshot of one image row
    pub fn image(&self, image_id: i64) -> Option<ImageRecord> {
        self.state.lock().images.get(&image_id).cloned()
    }

    /// Delete an image, cascading to its detections
    pub fn delete_image(&self, image_id: i64) {
        let mut state = self.state.lock();
        state.images.remove(&image_id);
        state.detections.retain(|d| d.image_id != image_id);
    }

    /// Make every following replacement fail without changing state
    pub fn set_fail_replacements(&self, fail: bool) {
        self.fail_replacements.store(fail, Ordering::SeqCst);
    }

    fn snapshot(&self, image_id: i64) -> Vec<DetectionRecord> {
        self.state
            .lock()
            .detections
            .iter()
            .filter(|d| d.image_id == image_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DetectionStore for InMemoryStore {
    async fn find_image(&self, image_id: i64) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.image(image_id))
    }

    async fn list_detections(&self, image_id: i64) -> Result<Vec<DetectionRecord>, StoreError> {
        Ok(self.snapshot(image_id))
    }

    async fn replace_detections(
        &self,
        image_id: i64,
        detections: &[NewDetection],
        annotated_path: Option<&str>,
    ) -> Result<Vec<DetectionRecord>, StoreError> {
        // One lock for all three steps; nothing is touched before validation
        let mut state = self.state.lock();

        if self.fail_replacements.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("replacement rejected".to_string()));
        }
        if !state.images.contains_key(&image_id) {
            return Err(StoreError::ImageVanished(image_id));
        }

        state.detections.retain(|d| d.image_id != image_id);

        let now = Utc::now();
        let mut inserted = Vec::with_capacity(detections.len());
        for detection in detections {
            state.next_detection_id += 1;
            let record = detection
                .clone()
                .into_record(state.next_detection_id, image_id, now);
            state.detections.push(record.clone());
            inserted.push(record);
        }

        if let Some(path) = annotated_path {
            if let Some(image) = state.images.get_mut(&image_id) {
                image.annotated_path = Some(path.to_string());
            }
        }

        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Confidence;

    fn image(id: i64, user_id: i64) -> ImageRecord {
        ImageRecord {
            id,
            user_id,
            filename: format!("{id}.jpg"),
            path: format!("{user_id}/{id}.jpg"),
            annotated_path: None,
            created_at: Utc::now(),
        }
    }

    fn detection(class_name: &str) -> NewDetection {
        NewDetection {
            class_name: class_name.to_string(),
            x: 1,
            y: 2,
            w: 3,
            h: 4,
            confidence: Confidence::from_f64(0.5),
        }
    }

    #[tokio::test]
    async fn test_replace_with_rows_attributes_to_image() {
        let store = InMemoryStore::new();
        store.insert_image(image(1, 7));
        store.insert_image(image(2, 7));

        store
            .replace_detections(2, &[detection("dog")], None)
            .await
            .unwrap();
        let inserted = store
            .replace_detections(1, &[detection("car"), detection("bus")], None)
            .await
            .unwrap();

        assert_eq!(inserted.len(), 2);
        let rows = store.list_detections(1).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|d| d.image_id == 1));
        assert_eq!(rows[0].class_name, "car");
        assert_eq!(rows[1].class_name, "bus");
        assert_eq!(store.list_detections(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_with_empty_clears_rows() {
        let store = InMemoryStore::new();
        store.insert_image(image(1, 7));
        store
            .replace_detections(1, &[detection("car")], None)
            .await
            .unwrap();

        let inserted = store.replace_detections(1, &[], None).await.unwrap();

        assert!(inserted.is_empty());
        assert!(store.list_detections(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_annotated_path_only_set_when_given() {
        let store = InMemoryStore::new();
        store.insert_image(image(1, 7));

        store
            .replace_detections(1, &[], Some("annotated/a.png"))
            .await
            .unwrap();
        store.replace_detections(1, &[], None).await.unwrap();

        assert_eq!(
            store.image(1).unwrap().annotated_path.as_deref(),
            Some("annotated/a.png")
        );
    }

    #[tokio::test]
    async fn test_failed_replace_leaves_state_untouched() {
        let store = InMemoryStore::new();
        store.insert_image(image(1, 7));
        store
            .replace_detections(1, &[detection("car")], None)
            .await
            .unwrap();

        store.set_fail_replacements(true);
        let result = store
            .replace_detections(1, &[], Some("annotated/b.png"))
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.list_detections(1).await.unwrap().len(), 1);
        assert_eq!(store.image(1).unwrap().annotated_path, None);
    }

    #[tokio::test]
    async fn test_replace_for_missing_image() {
        let store = InMemoryStore::new();
        let result = store.replace_detections(9, &[detection("car")], None).await;
        assert!(matches!(result, Err(StoreError::ImageVanished(9))));
    }

    #[tokio::test]
    async fn test_delete_image_cascades() {
        let store = InMemoryStore::new();
        store.insert_image(image(1, 7));
        store
            .replace_detections(1, &[detection("car")], None)
            .await
            .unwrap();

        store.delete_image(1);

        assert!(store.find_image(1).await.unwrap().is_none());
        assert!(store.list_detections(1).await.unwrap().is_empty());
    }
}
