use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::detection_engine::DetectionBox;
use crate::resolution::Resolution;

/// Persisted result of one processed resolution
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FrameRecord {
    pub id: Uuid,
    /// Filename the client uploaded
    pub original_filename: String,
    /// Synthesized `{timestamp}_{prefix}_{index}_{resolution}.png`
    pub indexed_filename: String,
    /// Resolution label (`256p`, `720p`, `1080p`)
    pub resolution: String,
    pub detection_count: i32,
    pub detections: Json<Vec<DetectionBox>>,
    /// PNG bytes with boxes drawn
    #[serde(skip)]
    pub annotated_image: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub source_topic: String,
    pub created_at: DateTime<Utc>,
}

/// Record listing entry without the image payload
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FrameSummary {
    pub id: Uuid,
    pub original_filename: String,
    pub indexed_filename: String,
    pub resolution: String,
    pub detection_count: i32,
    pub detections: Json<Vec<DetectionBox>>,
    pub width: i32,
    pub height: i32,
    pub source_topic: String,
    pub created_at: DateTime<Utc>,
}

impl From<&FrameRecord> for FrameSummary {
    fn from(record: &FrameRecord) -> Self {
        Self {
            id: record.id,
            original_filename: record.original_filename.clone(),
            indexed_filename: record.indexed_filename.clone(),
            resolution: record.resolution.clone(),
            detection_count: record.detection_count,
            detections: Json(record.detections.0.clone()),
            width: record.width,
            height: record.height,
            source_topic: record.source_topic.clone(),
            created_at: record.created_at,
        }
    }
}

/// Fields supplied by the caller when appending a record
#[derive(Debug, Clone)]
pub struct NewFrameRecord {
    pub original_filename: String,
    pub indexed_filename: String,
    pub resolution: Resolution,
    pub detections: Vec<DetectionBox>,
    pub annotated_image: Bytes,
    pub width: u32,
    pub height: u32,
    pub source_topic: String,
}

impl NewFrameRecord {
    fn into_record(self, id: Uuid, created_at: DateTime<Utc>) -> FrameRecord {
        FrameRecord {
            id,
            original_filename: self.original_filename,
            indexed_filename: self.indexed_filename,
            resolution: self.resolution.label().to_string(),
            detection_count: self.detections.len() as i32,
            detections: Json(self.detections),
            annotated_image: self.annotated_image.to_vec(),
            width: self.width as i32,
            height: self.height as i32,
            source_topic: self.source_topic,
            created_at,
        }
    }
}

/// Listing parameters
#[derive(Debug, Clone)]
pub struct FrameQuery {
    /// Filter by resolution
    pub resolution: Option<Resolution>,
    /// Maximum number of results
    pub limit: i64,
    /// Offset for pagination
    pub offset: i64,
}

impl Default for FrameQuery {
    fn default() -> Self {
        Self {
            resolution: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Append-only record store with time-ordered reads
#[async_trait]
pub trait FrameStore: Send + Sync {
    /// Persist a record, stamping its id and creation time
    async fn append(&self, record: NewFrameRecord) -> Result<FrameRecord>;

    async fn get(&self, id: Uuid) -> Result<Option<FrameRecord>>;

    /// Newest first, without image payloads
    async fn list(&self, query: &FrameQuery) -> Result<Vec<FrameSummary>>;

    async fn count(&self, resolution: Option<Resolution>) -> Result<i64>;

    /// Most recent record for a resolution
    async fn latest(&self, resolution: Resolution) -> Result<Option<FrameRecord>>;

    /// Records created strictly after `after`, oldest first
    async fn newer_than(
        &self,
        resolution: Resolution,
        after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FrameRecord>>;

    /// Connectivity check
    async fn ping(&self) -> Result<()>;
}

/// Creation-time source that never repeats or goes backwards.
///
/// Timestamps have microsecond resolution to match PostgreSQL `timestamptz`.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_micros: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let previous = self
            .last_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(wall.max(last + 1))
            })
            .unwrap_or(wall);
        let stamped = wall.max(previous + 1);

        DateTime::from_timestamp_micros(stamped).unwrap_or_else(Utc::now)
    }
}

/// Runs one stamped write at a time so commit order matches `created_at` order.
///
/// Readers page with a strict `created_at > cursor` and must never see a
/// record commit behind a cursor that already passed its stamp.
#[derive(Debug, Default)]
pub struct SerialStamper {
    clock: MonotonicClock,
    gate: tokio::sync::Mutex<()>,
}

impl SerialStamper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp a creation time and run `write` with it while holding the gate
    pub async fn stamped<F, Fut, T>(&self, write: F) -> T
    where
        F: FnOnce(DateTime<Utc>) -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.gate.lock().await;
        write(self.clock.now()).await
    }
}

/// Frame store backed by PostgreSQL
pub struct PgFrameStore {
    pool: PgPool,
    stamper: SerialStamper,
}

const RECORD_COLUMNS: &str = "id, original_filename, indexed_filename, resolution, \
     detection_count, detections, annotated_image, width, height, source_topic, created_at";

const SUMMARY_COLUMNS: &str = "id, original_filename, indexed_filename, resolution, \
     detection_count, detections, width, height, source_topic, created_at";

impl PgFrameStore {
    /// Create a new store with a connection pool
    pub async fn new(config: &DatabaseConfig, url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self {
            pool,
            stamper: SerialStamper::new(),
        })
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
}

#[async_trait]
impl FrameStore for PgFrameStore {
    #[instrument(skip(self, record), fields(filename = %record.indexed_filename, resolution = %record.resolution))]
    async fn append(&self, record: NewFrameRecord) -> Result<FrameRecord> {
        let record = self
            .stamper
            .stamped(|created_at| async move {
                let record = record.into_record(Uuid::new_v4(), created_at);

                sqlx::query(
                    r#"
                    INSERT INTO frame_records (
                        id, original_filename, indexed_filename, resolution,
                        detection_count, detections, annotated_image,
                        width, height, source_topic, created_at
                    ) VALUES (
                        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11
                    )
                    "#,
                )
                .bind(record.id)
                .bind(&record.original_filename)
                .bind(&record.indexed_filename)
                .bind(&record.resolution)
                .bind(record.detection_count)
                .bind(&record.detections)
                .bind(&record.annotated_image)
                .bind(record.width)
                .bind(record.height)
                .bind(&record.source_topic)
                .bind(record.created_at)
                .execute(&self.pool)
                .await
                .context("Failed to insert frame record")?;

                Ok::<_, anyhow::Error>(record)
            })
            .await?;

        debug!(id = %record.id, "Frame record stored");
        metrics::counter!("detector.frames.persisted").increment(1);

        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<FrameRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM frame_records WHERE id = $1");
        let record = sqlx::query_as::<_, FrameRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query frame record")?;

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn list(&self, query: &FrameQuery) -> Result<Vec<FrameSummary>> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM frame_records \
             WHERE ($1::text IS NULL OR resolution = $1) \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        );
        let records = sqlx::query_as::<_, FrameSummary>(&sql)
            .bind(query.resolution.map(|r| r.label()))
            .bind(query.limit)
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list frame records")?;

        Ok(records)
    }

    async fn count(&self, resolution: Option<Resolution>) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM frame_records
            WHERE ($1::text IS NULL OR resolution = $1)
            "#,
        )
        .bind(resolution.map(|r| r.label()))
        .fetch_one(&self.pool)
        .await
        .context("Failed to count frame records")?;

        Ok(count.0)
    }

    async fn latest(&self, resolution: Resolution) -> Result<Option<FrameRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM frame_records \
             WHERE resolution = $1 ORDER BY created_at DESC LIMIT 1"
        );
        let record = sqlx::query_as::<_, FrameRecord>(&sql)
            .bind(resolution.label())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query latest frame record")?;

        Ok(record)
    }

    async fn newer_than(
        &self,
        resolution: Resolution,
        after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FrameRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM frame_records \
             WHERE resolution = $1 AND created_at > $2 \
             ORDER BY created_at ASC LIMIT $3"
        );
        let records = sqlx::query_as::<_, FrameRecord>(&sql)
            .bind(resolution.label())
            .bind(after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query newer frame records")?;

        Ok(records)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}

/// In-process frame store, used when no database is configured
#[derive(Default)]
pub struct MemoryFrameStore {
    records: RwLock<Vec<FrameRecord>>,
    clock: MonotonicClock,
}

impl MemoryFrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matching(records: &[FrameRecord], resolution: Resolution) -> impl Iterator<Item = &FrameRecord> {
        records.iter().filter(move |r| r.resolution == resolution.label())
    }
}

#[async_trait]
impl FrameStore for MemoryFrameStore {
    async fn append(&self, record: NewFrameRecord) -> Result<FrameRecord> {
        let mut records = self.records.write();
        // Stamp under the lock so insertion order matches creation order.
        let record = record.into_record(Uuid::new_v4(), self.clock.now());
        records.push(record.clone());

        metrics::counter!("detector.frames.persisted").increment(1);
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<FrameRecord>> {
        Ok(self.records.read().iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self, query: &FrameQuery) -> Result<Vec<FrameSummary>> {
        let records = self.records.read();
        let label = query.resolution.map(|r| r.label());

        Ok(records
            .iter()
            .rev()
            .filter(|r| label.map_or(true, |l| r.resolution == l))
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .map(FrameSummary::from)
            .collect())
    }

    async fn count(&self, resolution: Option<Resolution>) -> Result<i64> {
        let records = self.records.read();
        let count = match resolution {
            Some(resolution) => Self::matching(&records, resolution).count(),
            None => records.len(),
        };
        Ok(count as i64)
    }

    async fn latest(&self, resolution: Resolution) -> Result<Option<FrameRecord>> {
        let records = self.records.read();
        Ok(Self::matching(&records, resolution).last().cloned())
    }

    async fn newer_than(
        &self,
        resolution: Resolution,
        after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FrameRecord>> {
        let records = self.records.read();
        Ok(Self::matching(&records, resolution)
            .filter(|r| r.created_at > after)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
