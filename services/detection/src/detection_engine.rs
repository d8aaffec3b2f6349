//! Adapter around the external object-detection capability.
//!
//! The model itself runs elsewhere. [`DetectionEngineClient`] owns a bounded
//! job queue with a single consumer task, so every inference request in the
//! process is executed one at a time in arrival order. Callers only see an
//! async `infer` call.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::annotate::render_annotations;
use crate::config::InferenceConfig;
use crate::error::DetectionError;
use crate::frame_decoder::DecodedImage;

/// Class labels of the COCO-trained models the engine serves
pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Corner coordinates in the submitted image's pixel space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// One detected object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    #[serde(rename = "class")]
    pub class_name: String,
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl DetectionBox {
    /// Clamp confidence, order corners and fill a missing class name
    pub fn normalized(mut self, labels: &[String]) -> Self {
        self.confidence = if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        };

        let BoundingBox { x1, y1, x2, y2 } = self.bbox;
        self.bbox = BoundingBox {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        };

        if self.class_name.is_empty() {
            self.class_name = labels
                .get(self.class_id as usize)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", self.class_id));
        }

        self
    }
}

/// Thresholds passed with every inference call
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InferenceParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl From<&InferenceConfig> for InferenceParams {
    fn from(config: &InferenceConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
        }
    }
}

/// Result of one inference call
#[derive(Debug, Clone)]
pub struct Inference {
    pub detections: Vec<DetectionBox>,
    /// PNG-encoded image with boxes drawn
    pub annotated_image: Bytes,
}

/// The detection capability: image in, boxes and annotated image out
#[async_trait]
pub trait Detector: Send + Sync {
    /// Model label reported to clients
    fn model_name(&self) -> &str;

    /// Class label table, indexed by class id
    fn labels(&self) -> &[String];

    async fn infer(
        &self,
        image: &DecodedImage,
        params: &InferenceParams,
    ) -> Result<Inference, DetectionError>;
}

struct InferenceJob {
    image: DecodedImage,
    reply: oneshot::Sender<Result<Inference, DetectionError>>,
}

/// Serialized handle to a [`Detector`].
///
/// Cloning is cheap; all clones feed the same consumer task.
#[derive(Clone)]
pub struct DetectionEngineClient {
    jobs: mpsc::Sender<InferenceJob>,
    model_name: Arc<str>,
    labels: Arc<[String]>,
    params: InferenceParams,
}

impl DetectionEngineClient {
    /// Start the consumer task. Must be called within a Tokio runtime.
    pub fn spawn(detector: Arc<dyn Detector>, params: InferenceParams, queue_depth: usize) -> Self {
        let (jobs, receiver) = mpsc::channel(queue_depth.max(1));
        let model_name: Arc<str> = Arc::from(detector.model_name());
        let labels: Arc<[String]> = Arc::from(detector.labels());

        tokio::spawn(run_engine(detector, params, labels.clone(), receiver));

        info!(
            model = %model_name,
            queue_depth = queue_depth,
            "Detection engine client started"
        );

        Self {
            jobs,
            model_name,
            labels,
            params,
        }
    }

    /// Queue an image for inference and wait for its result
    pub async fn infer(&self, image: DecodedImage) -> Result<Inference, DetectionError> {
        let (reply, response) = oneshot::channel();

        self.jobs
            .send(InferenceJob { image, reply })
            .await
            .map_err(|_| DetectionError::EngineUnavailable)?;

        response
            .await
            .map_err(|_| DetectionError::EngineUnavailable)?
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn params(&self) -> &InferenceParams {
        &self.params
    }
}

async fn run_engine(
    detector: Arc<dyn Detector>,
    params: InferenceParams,
    labels: Arc<[String]>,
    mut jobs: mpsc::Receiver<InferenceJob>,
) {
    while let Some(job) = jobs.recv().await {
        let started = Instant::now();

        let result = detector
            .infer(&job.image, &params)
            .await
            .map(|inference| normalize(inference, &labels, params.max_detections));

        let elapsed = started.elapsed();
        metrics::histogram!("detector.inference.duration_seconds").record(elapsed.as_secs_f64());

        match &result {
            Ok(inference) => debug!(
                detections = inference.detections.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Inference complete"
            ),
            Err(e) => {
                metrics::counter!("detector.inference.failures").increment(1);
                warn!(error = %e, "Inference failed");
            }
        }

        // Caller may have gone away; its result is simply dropped.
        let _ = job.reply.send(result);
    }

    info!("Detection engine queue closed");
}

fn normalize(mut inference: Inference, labels: &[String], max_detections: usize) -> Inference {
    inference.detections = inference
        .detections
        .into_iter()
        .take(max_detections)
        .map(|d| d.normalized(labels))
        .collect();
    inference
}

/// Detector backed by an HTTP inference server
pub struct RemoteDetector {
    client: reqwest::Client,
    infer_url: String,
    model_name: String,
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteResponse {
    #[serde(default)]
    detections: Vec<RemoteDetection>,
    #[serde(default)]
    annotated_image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteDetection {
    class_id: u32,
    #[serde(default, rename = "class")]
    class_name: Option<String>,
    confidence: f32,
    bbox: BoundingBox,
}

impl RemoteDetector {
    pub fn new(config: &InferenceConfig) -> Result<Self, DetectionError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DetectionError::Inference(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            infer_url: format!("{}/infer", config.endpoint.trim_end_matches('/')),
            model_name: config.model_name.clone(),
            labels: COCO_LABELS.iter().map(|l| l.to_string()).collect(),
        })
    }
}

#[async_trait]
impl Detector for RemoteDetector {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    async fn infer(
        &self,
        image: &DecodedImage,
        params: &InferenceParams,
    ) -> Result<Inference, DetectionError> {
        let mime = image::guess_format(&image.encoded)
            .map(|format| format.to_mime_type())
            .unwrap_or("application/octet-stream");

        let response = self
            .client
            .post(&self.infer_url)
            .query(&[
                ("confidence", params.confidence_threshold.to_string()),
                ("iou", params.iou_threshold.to_string()),
                ("max_det", params.max_detections.to_string()),
            ])
            .header(CONTENT_TYPE, mime)
            .body(image.encoded.clone())
            .send()
            .await
            .map_err(|e| DetectionError::Inference(format!("Inference request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DetectionError::Inference(format!(
                "Inference server returned {status}"
            )));
        }

        let body: RemoteResponse = response
            .json()
            .await
            .map_err(|e| DetectionError::Inference(format!("Invalid inference response: {e}")))?;

        let detections: Vec<DetectionBox> = body
            .detections
            .into_iter()
            .map(|d| DetectionBox {
                class_name: d.class_name.unwrap_or_default(),
                class_id: d.class_id,
                confidence: d.confidence,
                bbox: d.bbox,
            })
            .map(|d| d.normalized(&self.labels))
            .collect();

        let annotated_image = match body.annotated_image.as_deref().map(|b| STANDARD.decode(b)) {
            Some(Ok(bytes)) => Bytes::from(bytes),
            Some(Err(e)) => {
                warn!(error = %e, "Inference server sent unreadable annotation, rendering locally");
                render_annotations(&image.image, &detections)?
            }
            None => render_annotations(&image.image, &detections)?,
        };

        Ok(Inference {
            detections,
            annotated_image,
        })
    }
}
