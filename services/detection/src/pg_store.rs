use crate::config::DatabaseConfig;
use crate::models::{Confidence, DetectionRecord, ImageRecord, NewDetection};
use crate::store::{DetectionStore, StoreError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};

/// Detection row as selected, confidence scaled to ten-thousandths
#[derive(Debug, FromRow)]
struct DetectionRow {
    id: i64,
    image_id: i64,
    class_name: String,
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    confidence_bp: i32,
    created_at: DateTime<Utc>,
}

impl From<DetectionRow> for DetectionRecord {
    fn from(row: DetectionRow) -> Self {
        Self {
            id: row.id,
            image_id: row.image_id,
            class_name: row.class_name,
            x: row.x,
            y: row.y,
            w: row.w,
            h: row.h,
            confidence: Confidence::from_basis_points(row.confidence_bp),
            created_at: row.created_at,
        }
    }
}

/// PostgreSQL-backed image and detection store
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new store with its own connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DetectionStore for PgStore {
    async fn find_image(&self, image_id: i64) -> Result<Option<ImageRecord>, StoreError> {
        let image = sqlx::query_as::<_, ImageRecord>(
            r#"
            SELECT id, user_id, filename, path, annotated_path, created_at
            FROM images
            WHERE id = $1
            "#,
        )
        .bind(image_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(image)
    }

    async fn list_detections(&self, image_id: i64) -> Result<Vec<DetectionRecord>, StoreError> {
        let rows = sqlx::query_as::<_, DetectionRow>(
            r#"
            SELECT id, image_id, class_name, x, y, w, h,
                   (confidence * 10000)::INT4 AS confidence_bp,
                   created_at
            FROM detections
            WHERE image_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(image_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, detections), fields(detection_count = detections.len()))]
    async fn replace_detections(
        &self,
        image_id: i64,
        detections: &[NewDetection],
        annotated_path: Option<&str>,
    ) -> Result<Vec<DetectionRecord>, StoreError> {
        // Dropping `tx` on any early return rolls back
        let mut tx = self.pool.begin().await?;

        // Row lock serializes replacements for this image across processes
        let locked: Option<(i64,)> = sqlx::query_as("SELECT id FROM images WHERE id = $1 FOR UPDATE")
            .bind(image_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StoreError::ImageVanished(image_id));
        }

        let deleted = sqlx::query("DELETE FROM detections WHERE image_id = $1")
            .bind(image_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let mut inserted = Vec::with_capacity(detections.len());
        for detection in detections {
            let row = sqlx::query_as::<_, DetectionRow>(
                r#"
                INSERT INTO detections (
                    image_id, class_name, x, y, w, h, confidence, created_at
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, ($7::INT4)::NUMERIC / 10000, NOW()
                )
                RETURNING id, image_id, class_name, x, y, w, h,
                          (confidence * 10000)::INT4 AS confidence_bp,
                          created_at
                "#,
            )
            .bind(image_id)
            .bind(&detection.class_name)
            .bind(detection.x)
            .bind(detection.y)
            .bind(detection.w)
            .bind(detection.h)
            .bind(i32::from(detection.confidence.basis_points()))
            .fetch_one(&mut *tx)
            .await?;

            inserted.push(row.into());
        }

        if let Some(path) = annotated_path {
            sqlx::query("UPDATE images SET annotated_path = $1 WHERE id = $2")
                .bind(path)
                .bind(image_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        debug!(
            image_id = image_id,
            deleted = deleted,
            inserted = inserted.len(),
            "Detections replaced"
        );

        Ok(inserted)
    }
}
