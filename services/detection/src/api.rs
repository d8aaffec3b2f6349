use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{ApiConfig, Config};
use crate::detection_engine::DetectionBox;
use crate::dispatch::{Analysis, DispatchCoordinator, ImageDimensions};
use crate::error::DetectionError;
use crate::frame_decoder::{extract_topic, recover_payload, FrameDecoder, RequestBody};
use crate::frame_store::{FrameQuery, FrameRecord, FrameSummary};
use crate::resolution::Resolution;
use crate::stream_cursor::{parse_start_time, StreamCursor, STREAM_CONTENT_TYPE};

/// Largest page `/detections` will return
const MAX_PAGE_SIZE: i64 = 500;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: DispatchCoordinator,
    pub config: Arc<Config>,
}

/// Model details echoed in detection responses
#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

/// Single-image detection response
#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub image_dimensions: ImageDimensions,
    pub detection_count: usize,
    pub detections: Vec<DetectionBox>,
    /// Base64 PNG
    pub annotated_image: String,
    pub model_info: ModelInfo,
}

/// `/detect/base64` request body
#[derive(Debug, Deserialize)]
pub struct Base64Request {
    pub image: String,
}

/// `/detect/base64/batch` request body
#[derive(Debug, Deserialize)]
pub struct Base64BatchRequest {
    pub images: Vec<Base64Item>,
}

#[derive(Debug, Deserialize)]
pub struct Base64Item {
    pub id: Option<String>,
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct Base64ItemResult {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_dimensions: Option<ImageDimensions>,
    pub detection_count: usize,
    pub detections: Vec<DetectionBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Base64BatchResponse {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub total_count: usize,
    pub successful_count: usize,
    pub failed_count: usize,
    pub results: Vec<Base64ItemResult>,
}

/// 400 body for a batch missing required files
#[derive(Debug, Serialize)]
pub struct MissingFilesResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
    pub missing: Vec<String>,
}

/// Optional topic override
#[derive(Debug, Deserialize)]
pub struct TopicQuery {
    pub topic: Option<String>,
}

/// Query parameters for record listing
#[derive(Debug, Deserialize)]
pub struct DetectionListQuery {
    /// Filter by resolution label
    pub resolution: Option<String>,
    /// Maximum results
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Offset for pagination
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Record list response
#[derive(Debug, Serialize)]
pub struct DetectionListResponse {
    pub detections: Vec<FrameSummary>,
    pub total_count: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub start_time: Option<String>,
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

    let body_limit = state.config.max_body_bytes();

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/info", get(model_info))
        .route("/detect", post(detect))
        .route("/detect/batch", post(detect_batch))
        .route("/detect/cluster-batch", post(detect_batch))
        .route("/detect/base64", post(detect_base64))
        .route("/detect/base64/batch", post(detect_base64_batch))
        .route("/detect/:resolution", post(detect_resolution))
        .route("/detections", get(list_detections))
        .route("/detections/:id/image", get(detection_image))
        .route("/stream/:resolution/latest", get(stream_latest))
        .route("/stream/:resolution", get(stream_frames))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service.name,
        "model": state.coordinator.engine().model_name(),
        "timestamp": Utc::now(),
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.coordinator.store().ping().await {
        Ok(()) => (
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

/// Model and pipeline configuration
async fn model_info(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.coordinator.engine();
    let classes: serde_json::Map<String, serde_json::Value> = engine
        .labels()
        .iter()
        .enumerate()
        .map(|(id, name)| (id.to_string(), serde_json::Value::from(name.as_str())))
        .collect();

    Json(serde_json::json!({
        "model": engine.model_name(),
        "num_classes": classes.len(),
        "classes": classes,
        "configuration": {
            "confidence_threshold": engine.params().confidence_threshold,
            "iou_threshold": engine.params().iou_threshold,
            "max_detections": engine.params().max_detections,
            "max_upload_mb": state.config.upload.max_upload_mb,
            "persistence_enabled": state.coordinator.persistence_enabled(),
            "forwarding_enabled": state.config.forwarding.enabled,
            "instance_prefix": state.config.naming.instance_prefix,
        }
    }))
}

/// Single image, any field name
#[instrument(skip(state, request))]
async fn detect(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<DetectResponse>, DetectionError> {
    let body = RequestBody::read(request, state.config.max_body_bytes()).await?;
    let frame = FrameDecoder::decode_single(&body)?;
    let analysis = state.coordinator.analyze(frame.bytes).await?;

    Ok(Json(detect_response(&state, analysis)))
}

/// Three resolution files plus optional topic
#[instrument(skip(state, request))]
async fn detect_batch(
    State(state): State<AppState>,
    Query(query): Query<TopicQuery>,
    request: Request,
) -> Result<Response, DetectionError> {
    let body = RequestBody::read(request, state.config.max_body_bytes()).await?;
    let (topic, topic_source) = extract_topic(&body, query.topic.as_deref());

    let entries = match FrameDecoder::decode_batch(&body) {
        Ok(entries) => entries,
        Err(errors) => return Ok(missing_files_response(errors)),
    };

    info!(
        source_topic = %topic,
        topic_source = ?topic_source,
        entries = entries.len(),
        "Batch received"
    );

    let outcome = state.coordinator.process_batch(entries, &topic).await;
    Ok((outcome.status_code(), Json(outcome)).into_response())
}

#[instrument(skip(state, payload))]
async fn detect_base64(
    State(state): State<AppState>,
    payload: Result<Json<Base64Request>, JsonRejection>,
) -> Result<Json<DetectResponse>, DetectionError> {
    let Json(request) = payload.map_err(|e| DetectionError::InvalidRequest(e.body_text()))?;
    let bytes = decode_base64_image(&request.image)?;
    let analysis = state.coordinator.analyze(bytes).await?;

    Ok(Json(detect_response(&state, analysis)))
}

#[instrument(skip(state, payload))]
async fn detect_base64_batch(
    State(state): State<AppState>,
    payload: Result<Json<Base64BatchRequest>, JsonRejection>,
) -> Result<Json<Base64BatchResponse>, DetectionError> {
    let Json(request) = payload.map_err(|e| DetectionError::InvalidRequest(e.body_text()))?;
    if request.images.is_empty() {
        return Err(DetectionError::MissingInput("images".to_string()));
    }

    let coordinator = &state.coordinator;
    let jobs = request.images.into_iter().enumerate().map(|(i, item)| async move {
        let id = item.id.unwrap_or_else(|| i.to_string());
        let analysis = match decode_base64_image(&item.data) {
            Ok(bytes) => coordinator.analyze(bytes).await,
            Err(e) => Err(e),
        };

        match analysis {
            Ok(analysis) => Base64ItemResult {
                id,
                success: true,
                image_dimensions: Some(analysis.dimensions),
                detection_count: analysis.inference.detections.len(),
                detections: analysis.inference.detections,
                annotated_image: Some(STANDARD.encode(&analysis.inference.annotated_image)),
                error: None,
            },
            Err(e) => Base64ItemResult {
                id,
                success: false,
                image_dimensions: None,
                detection_count: 0,
                detections: Vec::new(),
                annotated_image: None,
                error: Some(e.to_string()),
            },
        }
    });

    let results = join_all(jobs).await;
    let successful_count = results.iter().filter(|r| r.success).count();

    Ok(Json(Base64BatchResponse {
        success: successful_count == results.len(),
        timestamp: Utc::now(),
        total_count: results.len(),
        successful_count,
        failed_count: results.len() - successful_count,
        results,
    }))
}

/// One pre-resolved resolution; responds with the annotated PNG
#[instrument(skip(state, request))]
async fn detect_resolution(
    State(state): State<AppState>,
    Path(resolution): Path<String>,
    Query(query): Query<TopicQuery>,
    request: Request,
) -> Result<Response, DetectionError> {
    let resolution: Resolution = resolution.parse()?;

    let body = RequestBody::read(request, state.config.max_body_bytes()).await?;
    let frame = FrameDecoder::decode_single(&body)?;
    let (topic, _) = extract_topic(&body, query.topic.as_deref());

    let processed = state
        .coordinator
        .process_frame(resolution, frame, &topic)
        .await?;
    let record = state.coordinator.persist(&processed, &topic).await?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    insert_header(&mut headers, "x-filename", &processed.indexed_filename);
    insert_header(
        &mut headers,
        "x-detection-count",
        &processed.detections.len().to_string(),
    );
    if let Some(record) = record {
        insert_header(&mut headers, "x-record-id", &record.id.to_string());
    }

    Ok((StatusCode::OK, headers, processed.annotated_image).into_response())
}

/// List records with pagination
#[instrument(skip(state))]
async fn list_detections(
    State(state): State<AppState>,
    Query(params): Query<DetectionListQuery>,
) -> Result<Json<DetectionListResponse>, DetectionError> {
    let resolution = params
        .resolution
        .as_deref()
        .map(str::parse::<Resolution>)
        .transpose()
        .map_err(|e| DetectionError::InvalidRequest(e.to_string()))?;

    let limit = params.limit.clamp(1, MAX_PAGE_SIZE);
    let offset = params.offset.max(0);

    let query = FrameQuery {
        resolution,
        limit: limit + 1, // Fetch one extra to check has_more
        offset,
    };

    let store = state.coordinator.store();
    let mut detections = store.list(&query).await.map_err(persistence_error)?;

    let has_more = detections.len() > limit as usize;
    if has_more {
        detections.pop();
    }

    let total_count = store.count(resolution).await.unwrap_or(0);

    Ok(Json(DetectionListResponse {
        detections,
        total_count,
        limit,
        offset,
        has_more,
    }))
}

/// Annotated image of one record
#[instrument(skip(state))]
async fn detection_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, DetectionError> {
    let id = Uuid::parse_str(&id).map_err(|_| DetectionError::NotFound("Detection".to_string()))?;

    let record = state
        .coordinator
        .store()
        .get(id)
        .await
        .map_err(persistence_error)?
        .ok_or_else(|| DetectionError::NotFound("Detection".to_string()))?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    insert_header(&mut headers, "x-filename", &record.indexed_filename);

    Ok((StatusCode::OK, headers, record.annotated_image).into_response())
}

/// Most recent frame for a resolution
#[instrument(skip(state))]
async fn stream_latest(
    State(state): State<AppState>,
    Path(resolution): Path<String>,
) -> Result<Response, DetectionError> {
    let resolution = parse_stream_resolution(&resolution)?;

    let record = state
        .coordinator
        .store()
        .latest(resolution)
        .await
        .map_err(persistence_error)?
        .ok_or_else(|| DetectionError::NotFound(format!("Frame for {resolution}")))?;

    Ok(latest_frame_response(record))
}

/// Continuous multipart stream, optionally replaying from `start_time`
#[instrument(skip(state))]
async fn stream_frames(
    State(state): State<AppState>,
    Path(resolution): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, DetectionError> {
    let resolution = parse_stream_resolution(&resolution)?;
    let start_time = query.start_time.as_deref().map(parse_start_time).transpose()?;

    let cursor = StreamCursor::open(
        state.coordinator.store().clone(),
        resolution,
        start_time,
        &state.config.stream,
    )
    .await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(STREAM_CONTENT_TYPE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    Ok((StatusCode::OK, headers, cursor.into_body()).into_response())
}

fn detect_response(state: &AppState, analysis: Analysis) -> DetectResponse {
    let engine = state.coordinator.engine();
    let params = engine.params();

    DetectResponse {
        success: true,
        timestamp: Utc::now(),
        image_dimensions: analysis.dimensions,
        detection_count: analysis.inference.detections.len(),
        detections: analysis.inference.detections,
        annotated_image: STANDARD.encode(&analysis.inference.annotated_image),
        model_info: ModelInfo {
            name: engine.model_name().to_string(),
            confidence_threshold: params.confidence_threshold,
            iou_threshold: params.iou_threshold,
            max_detections: params.max_detections,
        },
    }
}

fn latest_frame_response(record: FrameRecord) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=1"));
    insert_header(&mut headers, "x-frame-id", &record.id.to_string());
    insert_header(&mut headers, "x-frame-timestamp", &record.created_at.to_rfc3339());
    insert_header(
        &mut headers,
        "x-detection-count",
        &record.detection_count.to_string(),
    );

    (StatusCode::OK, headers, record.annotated_image).into_response()
}

fn missing_files_response(errors: Vec<DetectionError>) -> Response {
    let missing: Vec<String> = errors
        .iter()
        .map(|e| match e {
            DetectionError::MissingInput(name) => name.clone(),
            other => other.to_string(),
        })
        .collect();

    warn!(missing = ?missing, "Batch rejected: required files missing");

    let body = MissingFilesResponse {
        success: false,
        error: format!("Missing required files: {}", missing.join(", ")),
        code: "MISSING_INPUT".to_string(),
        missing,
    };

    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// Accepts bare base64 or a `data:image/...;base64,` URL
fn decode_base64_image(data: &str) -> Result<Bytes, DetectionError> {
    let payload = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };

    recover_payload(payload.as_bytes()).map(|(bytes, _)| bytes)
}

/// Unknown resolutions are a malformed request on stream endpoints
fn parse_stream_resolution(raw: &str) -> Result<Resolution, DetectionError> {
    raw.parse::<Resolution>()
        .map_err(|e| DetectionError::InvalidRequest(e.to_string()))
}

fn persistence_error(e: anyhow::Error) -> DetectionError {
    DetectionError::Persistence(format!("{e:#}"))
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => warn!(header = name, error = %e, "Skipping unrepresentable header value"),
    }
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
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png() -> Vec<u8> {
        let mut buf = Vec::new();
        RgbImage::new(2, 2)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_decode_base64_image_accepts_data_url() {
        let encoded = STANDARD.encode(png());
        let bytes = decode_base64_image(&format!("data:image/png;base64,{encoded}")).unwrap();
        assert_eq!(bytes.as_ref(), png().as_slice());
        assert!(decode_base64_image(&encoded).is_ok());
    }

    #[test]
    fn test_decode_base64_image_rejects_non_image() {
        let encoded = STANDARD.encode(b"hello world");
        assert!(matches!(
            decode_base64_image(&encoded),
            Err(DetectionError::DecodeFailure(_))
        ));
    }

    #[test]
    fn test_stream_resolution_is_bad_request() {
        let err = parse_stream_resolution("480p").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(parse_stream_resolution("720").unwrap(), Resolution::R720);
    }

    #[test]
    fn test_missing_files_response_status() {
        let response = missing_files_response(vec![DetectionError::MissingInput(
            "256.png".to_string(),
        )]);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
