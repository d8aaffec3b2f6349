//! Multi-resolution batch fan-out.
//!
//! One task per batch entry, bounded by a worker semaphore. The coordinator
//! awaits every task before it looks at any result, then persists the
//! successes concurrently. Each entry succeeds or fails on its own.

use axum::http::StatusCode;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::detection_engine::{DetectionBox, DetectionEngineClient, Inference};
use crate::error::DetectionError;
use crate::forwarder::{FrameSink, OutboundFrame};
use crate::frame_decoder::{decode_image, BatchEntry, DecodeStrategy, DecodedImage, RecoveredFrame};
use crate::frame_store::{FrameRecord, FrameStore, NewFrameRecord};
use crate::index_allocator::IndexAllocator;
use crate::resolution::Resolution;
use crate::size_guard::SizeGuard;

/// Width and height of a submitted image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

impl ImageDimensions {
    /// Whether the image has the nominal size of `resolution`
    pub fn matches_target(&self, resolution: Resolution) -> bool {
        (self.width, self.height) == resolution.target_dimensions()
    }
}

/// Overall classification of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    PartialSuccess,
    Failure,
}

impl BatchStatus {
    pub fn classify(successful: usize, total: usize) -> Self {
        if total > 0 && successful == total {
            BatchStatus::Success
        } else if successful > 0 {
            BatchStatus::PartialSuccess
        } else {
            BatchStatus::Failure
        }
    }

    /// 200 full, 207 partial, 500 total failure
    pub fn status_code(&self) -> StatusCode {
        match self {
            BatchStatus::Success => StatusCode::OK,
            BatchStatus::PartialSuccess => StatusCode::MULTI_STATUS,
            BatchStatus::Failure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Success => "success",
            BatchStatus::PartialSuccess => "partial_success",
            BatchStatus::Failure => "failure",
        }
    }
}

/// Outcome for one entry of a batch
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionResult {
    /// File identifier as submitted (`720.png`)
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<Uuid>,
    pub detection_count: usize,
    pub detections: Vec<DetectionBox>,
    #[serde(
        serialize_with = "base64_serde::serialize_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub annotated_image: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_dimensions: Option<ImageDimensions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decode_strategy: Option<DecodeStrategy>,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResolutionResult {
    fn failed(
        identifier: String,
        resolution: Option<Resolution>,
        error: &DetectionError,
        started: Instant,
    ) -> Self {
        Self {
            identifier,
            resolution,
            success: false,
            original_filename: None,
            indexed_filename: None,
            record_id: None,
            detection_count: 0,
            detections: Vec::new(),
            annotated_image: None,
            image_dimensions: None,
            decode_strategy: None,
            processing_time_ms: started.elapsed().as_millis() as u64,
            error: Some(error.to_string()),
        }
    }

    fn succeeded(identifier: String, frame: ProcessedFrame, started: Instant) -> Self {
        Self {
            identifier,
            resolution: Some(frame.resolution),
            success: true,
            original_filename: Some(frame.original_filename),
            indexed_filename: Some(frame.indexed_filename),
            record_id: None,
            detection_count: frame.detections.len(),
            detections: frame.detections,
            annotated_image: Some(frame.annotated_image),
            image_dimensions: Some(frame.dimensions),
            decode_strategy: Some(frame.strategy),
            processing_time_ms: started.elapsed().as_millis() as u64,
            error: None,
        }
    }

    fn to_new_record(&self, source_topic: &str) -> Option<NewFrameRecord> {
        let dimensions = self.image_dimensions?;
        Some(NewFrameRecord {
            original_filename: self.original_filename.clone()?,
            indexed_filename: self.indexed_filename.clone()?,
            resolution: self.resolution?,
            detections: self.detections.clone(),
            annotated_image: self.annotated_image.clone()?,
            width: dimensions.width,
            height: dimensions.height,
            source_topic: source_topic.to_string(),
        })
    }
}

/// Aggregated batch response
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub success: bool,
    pub status: BatchStatus,
    pub correlation_id: Uuid,
    pub source_topic: String,
    pub timestamp: DateTime<Utc>,
    pub total_count: usize,
    pub successful_count: usize,
    pub failed_count: usize,
    pub processing_time_ms: u64,
    pub results: Vec<ResolutionResult>,
}

impl BatchOutcome {
    fn new(
        correlation_id: Uuid,
        source_topic: String,
        results: Vec<ResolutionResult>,
        started: Instant,
    ) -> Self {
        let total_count = results.len();
        let successful_count = results.iter().filter(|r| r.success).count();
        let status = BatchStatus::classify(successful_count, total_count);

        Self {
            success: status == BatchStatus::Success,
            status,
            correlation_id,
            source_topic,
            timestamp: Utc::now(),
            total_count,
            successful_count,
            failed_count: total_count - successful_count,
            processing_time_ms: started.elapsed().as_millis() as u64,
            results,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status.status_code()
    }
}

/// A frame that went through detection
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub resolution: Resolution,
    pub original_filename: String,
    pub indexed_filename: String,
    pub dimensions: ImageDimensions,
    pub detections: Vec<DetectionBox>,
    pub annotated_image: Bytes,
    pub strategy: DecodeStrategy,
}

/// Detection result for an image with no resolution bookkeeping
#[derive(Debug, Clone)]
pub struct Analysis {
    pub dimensions: ImageDimensions,
    pub inference: Inference,
}

/// Size check, then decode. The decoder is never invoked for oversized input.
pub fn prepare_frame<F>(guard: &SizeGuard, bytes: &Bytes, decode: F) -> Result<DecodedImage, DetectionError>
where
    F: FnOnce(&Bytes) -> Result<DecodedImage, DetectionError>,
{
    guard.check(bytes.len())?;
    decode(bytes)
}

/// Fans batches out to bounded workers and aggregates their results
#[derive(Clone)]
pub struct DispatchCoordinator {
    engine: DetectionEngineClient,
    allocator: Arc<IndexAllocator>,
    size_guard: SizeGuard,
    sink: Arc<dyn FrameSink>,
    store: Arc<dyn FrameStore>,
    max_workers: usize,
    persistence_enabled: bool,
}

impl DispatchCoordinator {
    pub fn new(
        engine: DetectionEngineClient,
        allocator: Arc<IndexAllocator>,
        size_guard: SizeGuard,
        sink: Arc<dyn FrameSink>,
        store: Arc<dyn FrameStore>,
        max_workers: usize,
        persistence_enabled: bool,
    ) -> Self {
        Self {
            engine,
            allocator,
            size_guard,
            sink,
            store,
            max_workers: max_workers.max(1),
            persistence_enabled,
        }
    }

    pub fn engine(&self) -> &DetectionEngineClient {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn FrameStore> {
        &self.store
    }

    pub fn size_guard(&self) -> &SizeGuard {
        &self.size_guard
    }

    pub fn persistence_enabled(&self) -> bool {
        self.persistence_enabled
    }

    /// Process every entry, wait for all of them, then persist the successes
    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    pub async fn process_batch(&self, entries: Vec<BatchEntry>, source_topic: &str) -> BatchOutcome {
        let started = Instant::now();
        let correlation_id = Uuid::new_v4();

        // Bounds this batch only; concurrent batches each get their own workers
        let workers = Arc::new(Semaphore::new(self.max_workers));

        let identifiers: Vec<String> = entries.iter().map(|e| e.identifier.clone()).collect();
        let handles: Vec<_> = entries
            .into_iter()
            .map(|entry| {
                let coordinator = self.clone();
                let workers = workers.clone();
                let topic = source_topic.to_string();
                tokio::spawn(async move { coordinator.run_worker(entry, &workers, &topic).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (identifier, handle) in identifiers.into_iter().zip(handles) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(identifier = %identifier, error = %e, "Batch worker aborted");
                    let error = DetectionError::Inference(format!("worker aborted: {e}"));
                    let resolution = Resolution::from_file_key(&identifier);
                    results.push(ResolutionResult::failed(identifier, resolution, &error, started));
                }
            }
        }

        if self.persistence_enabled {
            self.persist_results(&mut results, source_topic).await;
        }

        let outcome = BatchOutcome::new(correlation_id, source_topic.to_string(), results, started);

        metrics::counter!("detector.batches.total", "status" => outcome.status.as_str()).increment(1);
        metrics::histogram!("detector.batches.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        info!(
            correlation_id = %correlation_id,
            source_topic = %source_topic,
            status = outcome.status.as_str(),
            successful = outcome.successful_count,
            failed = outcome.failed_count,
            elapsed_ms = outcome.processing_time_ms,
            "Batch processed"
        );

        outcome
    }

    async fn run_worker(
        &self,
        entry: BatchEntry,
        workers: &Semaphore,
        source_topic: &str,
    ) -> ResolutionResult {
        let started = Instant::now();
        let identifier = entry.identifier;

        let Some(resolution) = Resolution::from_file_key(&identifier) else {
            let error = DetectionError::UnknownResolution(identifier.clone());
            return ResolutionResult::failed(identifier, None, &error, started);
        };

        let frame = match entry.payload {
            Ok(frame) => frame,
            Err(error) => {
                metrics::counter!("detector.frames.failed", "resolution" => resolution.label())
                    .increment(1);
                return ResolutionResult::failed(identifier, Some(resolution), &error, started);
            }
        };

        let _permit = match workers.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let error = DetectionError::EngineUnavailable;
                return ResolutionResult::failed(identifier, Some(resolution), &error, started);
            }
        };

        match self.process_frame(resolution, frame, source_topic).await {
            Ok(processed) => {
                metrics::counter!("detector.frames.processed", "resolution" => resolution.label())
                    .increment(1);
                ResolutionResult::succeeded(identifier, processed, started)
            }
            Err(error) => {
                metrics::counter!("detector.frames.failed", "resolution" => resolution.label())
                    .increment(1);
                warn!(identifier = %identifier, error = %error, "Resolution failed");
                ResolutionResult::failed(identifier, Some(resolution), &error, started)
            }
        }
    }

    /// Size check, decode, name, detect and forward one frame
    pub async fn process_frame(
        &self,
        resolution: Resolution,
        frame: RecoveredFrame,
        source_topic: &str,
    ) -> Result<ProcessedFrame, DetectionError> {
        let decoded = self.decode_checked(frame.bytes).await?;
        let dimensions = ImageDimensions {
            width: decoded.width,
            height: decoded.height,
        };

        if !dimensions.matches_target(resolution) {
            let (target_width, target_height) = resolution.target_dimensions();
            debug!(
                resolution = %resolution,
                width = dimensions.width,
                height = dimensions.height,
                target_width,
                target_height,
                "Rendition differs from its nominal size"
            );
        }

        let indexed_filename = self.allocator.filename(resolution, None);
        let inference = self.engine.infer(decoded).await?;

        self.sink.submit(OutboundFrame {
            resolution,
            source_topic: source_topic.to_string(),
            filename: indexed_filename.clone(),
            annotated_image: inference.annotated_image.clone(),
        });

        debug!(
            resolution = %resolution,
            filename = %indexed_filename,
            detections = inference.detections.len(),
            "Frame processed"
        );

        Ok(ProcessedFrame {
            resolution,
            original_filename: frame.original_filename,
            indexed_filename,
            dimensions,
            detections: inference.detections,
            annotated_image: inference.annotated_image,
            strategy: frame.strategy,
        })
    }

    /// Size check, decode and detect without naming, forwarding or persisting
    pub async fn analyze(&self, bytes: Bytes) -> Result<Analysis, DetectionError> {
        let decoded = self.decode_checked(bytes).await?;
        let dimensions = ImageDimensions {
            width: decoded.width,
            height: decoded.height,
        };
        let inference = self.engine.infer(decoded).await?;

        Ok(Analysis {
            dimensions,
            inference,
        })
    }

    /// Persist one processed frame; failure is returned to the caller
    pub async fn persist(
        &self,
        frame: &ProcessedFrame,
        source_topic: &str,
    ) -> Result<Option<FrameRecord>, DetectionError> {
        if !self.persistence_enabled {
            return Ok(None);
        }

        let record = NewFrameRecord {
            original_filename: frame.original_filename.clone(),
            indexed_filename: frame.indexed_filename.clone(),
            resolution: frame.resolution,
            detections: frame.detections.clone(),
            annotated_image: frame.annotated_image.clone(),
            width: frame.dimensions.width,
            height: frame.dimensions.height,
            source_topic: source_topic.to_string(),
        };

        self.store
            .append(record)
            .await
            .map(Some)
            .map_err(|e| DetectionError::Persistence(format!("{e:#}")))
    }

    async fn decode_checked(&self, bytes: Bytes) -> Result<DecodedImage, DetectionError> {
        let guard = self.size_guard;
        tokio::task::spawn_blocking(move || prepare_frame(&guard, &bytes, decode_image))
            .await
            .map_err(|e| DetectionError::DecodeFailure(format!("decode task failed: {e}")))?
    }

    async fn persist_results(&self, results: &mut [ResolutionResult], source_topic: &str) {
        let pending: Vec<(usize, NewFrameRecord)> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.success)
            .filter_map(|(i, r)| r.to_new_record(source_topic).map(|record| (i, record)))
            .collect();

        let store = &self.store;
        let writes = pending
            .into_iter()
            .map(|(i, record)| async move { (i, store.append(record).await) });

        for (i, written) in join_all(writes).await {
            let result = &mut results[i];
            match written {
                Ok(record) => result.record_id = Some(record.id),
                Err(e) => {
                    let error = DetectionError::Persistence(format!("{e:#}"));
                    warn!(identifier = %result.identifier, error = %error, "Persisting result failed");
                    metrics::counter!("detector.frames.persist_failures").increment(1);
                    result.success = false;
                    result.error = Some(error.to_string());
                }
            }
        }
    }
}

/// Base64 serialization helper
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::Serializer;

    pub fn serialize_opt<S>(bytes: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceConfig;
    use crate::detection_engine::{BoundingBox, Detector, InferenceParams};
    use crate::forwarder::MockFrameSink;
    use crate::frame_store::{FrameQuery, FrameSummary, MemoryFrameStore};
    use async_trait::async_trait;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StaticDetector {
        labels: Vec<String>,
    }

    #[async_trait]
    impl Detector for StaticDetector {
        fn model_name(&self) -> &str {
            "static"
        }

        fn labels(&self) -> &[String] {
            &self.labels
        }

        async fn infer(
            &self,
            image: &DecodedImage,
            _params: &InferenceParams,
        ) -> Result<Inference, DetectionError> {
            Ok(Inference {
                detections: vec![DetectionBox {
                    class_name: String::new(),
                    class_id: 0,
                    confidence: 0.8,
                    bbox: BoundingBox {
                        x1: 0.0,
                        y1: 0.0,
                        x2: image.width as f32,
                        y2: image.height as f32,
                    },
                }],
                annotated_image: Bytes::from_static(b"annotated"),
            })
        }
    }

    /// Delegates to memory but rejects one resolution
    struct RejectingStore {
        inner: MemoryFrameStore,
        reject: Resolution,
    }

    #[async_trait]
    impl FrameStore for RejectingStore {
        async fn append(&self, record: NewFrameRecord) -> anyhow::Result<FrameRecord> {
            if record.resolution == self.reject {
                anyhow::bail!("connection reset");
            }
            self.inner.append(record).await
        }

        async fn get(&self, id: Uuid) -> anyhow::Result<Option<FrameRecord>> {
            self.inner.get(id).await
        }

        async fn list(&self, query: &FrameQuery) -> anyhow::Result<Vec<FrameSummary>> {
            self.inner.list(query).await
        }

        async fn count(&self, resolution: Option<Resolution>) -> anyhow::Result<i64> {
            self.inner.count(resolution).await
        }

        async fn latest(&self, resolution: Resolution) -> anyhow::Result<Option<FrameRecord>> {
            self.inner.latest(resolution).await
        }

        async fn newer_than(
            &self,
            resolution: Resolution,
            after: DateTime<Utc>,
            limit: i64,
        ) -> anyhow::Result<Vec<FrameRecord>> {
            self.inner.newer_than(resolution, after, limit).await
        }

        async fn ping(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn png_bytes(width: u32, height: u32) -> Bytes {
        let img = RgbImage::from_pixel(width, height, Rgb([10, 20, 30]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        Bytes::from(buf)
    }

    fn entry(identifier: &str, bytes: Bytes) -> BatchEntry {
        BatchEntry {
            identifier: identifier.to_string(),
            payload: Ok(RecoveredFrame {
                original_filename: identifier.to_string(),
                bytes,
                strategy: DecodeStrategy::Binary,
            }),
        }
    }

    fn full_batch() -> Vec<BatchEntry> {
        Resolution::ALL
            .iter()
            .map(|r| entry(r.file_key(), png_bytes(8, 6)))
            .collect()
    }

    fn engine() -> DetectionEngineClient {
        let detector = Arc::new(StaticDetector {
            labels: vec!["person".to_string()],
        });
        DetectionEngineClient::spawn(detector, InferenceParams::from(&InferenceConfig::default()), 8)
    }

    fn coordinator(
        sink: MockFrameSink,
        store: Arc<dyn FrameStore>,
        persistence_enabled: bool,
    ) -> DispatchCoordinator {
        DispatchCoordinator::new(
            engine(),
            Arc::new(IndexAllocator::new("test")),
            SizeGuard::new(1.0),
            Arc::new(sink),
            store,
            3,
            persistence_enabled,
        )
    }

    fn sink_expecting(times: usize) -> MockFrameSink {
        let mut sink = MockFrameSink::new();
        sink.expect_submit().times(times).return_const(());
        sink
    }

    #[tokio::test]
    async fn test_full_batch_succeeds_and_persists() {
        let store = Arc::new(MemoryFrameStore::new());
        let coordinator = coordinator(sink_expecting(3), store.clone(), true);

        let outcome = coordinator.process_batch(full_batch(), "cam-3").await;

        assert_eq!(outcome.status, BatchStatus::Success);
        assert_eq!(outcome.status_code(), StatusCode::OK);
        assert_eq!(outcome.successful_count, 3);
        assert_eq!(outcome.failed_count, 0);
        assert!(outcome.results.iter().all(|r| r.record_id.is_some()));
        assert_eq!(outcome.results[0].detections[0].class_name, "person");

        let stored = store.list(&FrameQuery::default()).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|r| r.source_topic == "cam-3"));
    }

    #[tokio::test]
    async fn test_one_corrupt_entry_is_partial() {
        let store = Arc::new(MemoryFrameStore::new());
        let coordinator = coordinator(sink_expecting(2), store, true);

        let mut entries = full_batch();
        entries[1] = entry("720.png", Bytes::from_static(b"\x89PNG\r\n\x1a\ntruncated"));

        let outcome = coordinator.process_batch(entries, "cam").await;

        assert_eq!(outcome.status, BatchStatus::PartialSuccess);
        assert_eq!(outcome.status_code(), StatusCode::MULTI_STATUS);
        assert_eq!(outcome.successful_count, 2);
        assert_eq!(outcome.failed_count, 1);
        assert!(outcome.results[1]
            .error
            .as_deref()
            .unwrap()
            .starts_with("Failed to decode image"));
    }

    #[tokio::test]
    async fn test_unknown_identifier_is_isolated() {
        let store = Arc::new(MemoryFrameStore::new());
        let coordinator = coordinator(sink_expecting(3), store, false);

        let mut entries = full_batch();
        entries.push(entry("480.png", png_bytes(2, 2)));

        let outcome = coordinator.process_batch(entries, "cam").await;

        assert_eq!(outcome.total_count, 4);
        assert_eq!(outcome.successful_count, 3);
        assert_eq!(outcome.results[3].error.as_deref(), Some("Unknown resolution: 480.png"));
    }

    #[tokio::test]
    async fn test_persistence_failure_downgrades_only_that_item() {
        let store = Arc::new(RejectingStore {
            inner: MemoryFrameStore::new(),
            reject: Resolution::R720,
        });
        let coordinator = coordinator(sink_expecting(3), store.clone(), true);

        let outcome = coordinator.process_batch(full_batch(), "cam").await;

        assert_eq!(outcome.status, BatchStatus::PartialSuccess);
        assert_eq!(outcome.successful_count, 2);
        let failed = &outcome.results[1];
        assert!(!failed.success);
        assert!(failed.error.as_deref().unwrap().contains("connection reset"));
        assert_eq!(store.count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_persistence_disabled_writes_nothing() {
        let store = Arc::new(MemoryFrameStore::new());
        let coordinator = coordinator(sink_expecting(3), store.clone(), false);

        let outcome = coordinator.process_batch(full_batch(), "cam").await;

        assert_eq!(outcome.status, BatchStatus::Success);
        assert!(outcome.results.iter().all(|r| r.record_id.is_none()));
        assert_eq!(store.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_all_failed_is_failure() {
        let store = Arc::new(MemoryFrameStore::new());
        let coordinator = coordinator(sink_expecting(0), store, true);

        let entries = Resolution::ALL
            .iter()
            .map(|r| entry(r.file_key(), Bytes::from_static(b"nope")))
            .collect();
        let outcome = coordinator.process_batch(entries, "cam").await;

        assert_eq!(outcome.status, BatchStatus::Failure);
        assert_eq!(outcome.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!outcome.success);
    }

    #[test]
    fn test_oversize_is_rejected_before_decode() {
        let guard = SizeGuard::new(0.001);
        let bytes = Bytes::from(vec![0u8; guard.limit_bytes() + 1]);
        let invoked = AtomicBool::new(false);

        let result = prepare_frame(&guard, &bytes, |b| {
            invoked.store(true, Ordering::SeqCst);
            decode_image(b)
        });

        assert!(matches!(result, Err(DetectionError::SizeLimitExceeded { .. })));
        assert!(!invoked.load(Ordering::SeqCst));
    }

    /// Parks every frame submitted for the `held` topic until released
    #[derive(Default)]
    struct GateSink {
        open: std::sync::Mutex<bool>,
        opened: std::sync::Condvar,
        parked: std::sync::atomic::AtomicUsize,
    }

    impl GateSink {
        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.opened.notify_all();
        }

        fn parked(&self) -> usize {
            self.parked.load(Ordering::SeqCst)
        }
    }

    impl FrameSink for GateSink {
        fn submit(&self, frame: OutboundFrame) {
            if frame.source_topic != "held" {
                return;
            }
            self.parked.fetch_add(1, Ordering::SeqCst);
            tokio::task::block_in_place(|| {
                let mut open = self.open.lock().unwrap();
                while !*open {
                    open = self.opened.wait(open).unwrap();
                }
            });
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 6)]
    async fn test_concurrent_batches_have_independent_workers() {
        let sink = Arc::new(GateSink::default());
        let coordinator = DispatchCoordinator::new(
            engine(),
            Arc::new(IndexAllocator::new("test")),
            SizeGuard::new(1.0),
            sink.clone(),
            Arc::new(MemoryFrameStore::new()),
            3,
            false,
        );

        // Every worker of the first batch ends up parked while holding its permit
        let held = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.process_batch(full_batch(), "held").await })
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while sink.parked() < 3 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first batch never parked its workers");

        let second = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            coordinator.process_batch(full_batch(), "free"),
        )
        .await;
        sink.release();

        let second = second.expect("second batch waited on the first batch's workers");
        assert_eq!(second.successful_count, 3);

        let held = held.await.unwrap();
        assert_eq!(held.successful_count, 3);
    }

    #[test]
    fn test_dimensions_against_nominal_size() {
        let full_hd = ImageDimensions {
            width: 1920,
            height: 1080,
        };
        assert!(full_hd.matches_target(Resolution::R1080));
        assert!(!full_hd.matches_target(Resolution::R720));
    }

    #[test]
    fn test_classification() {
        assert_eq!(BatchStatus::classify(3, 3), BatchStatus::Success);
        assert_eq!(BatchStatus::classify(1, 3), BatchStatus::PartialSuccess);
        assert_eq!(BatchStatus::classify(0, 3), BatchStatus::Failure);
        assert_eq!(BatchStatus::classify(0, 0), BatchStatus::Failure);
    }

    #[test]
    fn test_result_serializes_image_as_base64() {
        let result = ResolutionResult {
            annotated_image: Some(Bytes::from_static(b"abc")),
            ..ResolutionResult::failed(
                "256.png".to_string(),
                Some(Resolution::R256),
                &DetectionError::EngineUnavailable,
                Instant::now(),
            )
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["annotated_image"], "YWJj");
        assert_eq!(json["resolution"], "256p");
        assert!(json.get("record_id").is_none());
    }
}
