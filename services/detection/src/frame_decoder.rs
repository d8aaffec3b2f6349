//! Recovery of usable image buffers from ambiguous request bodies.
//!
//! Upstream capture clients do not agree on a wire format: some send plain
//! binary multipart files, some base64-wrap the file content without saying
//! so, and some produce bodies a strict multipart parser rejects. Recovery
//! runs an ordered list of attempt functions and tags the one that worked.
//!
//! Only format sniffing happens here. Full pixel decoding is deferred to
//! [`decode_image`], which callers run after the size guard.

use axum::body::{Body, Bytes};
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use base64::alphabet;
use base64::engine::general_purpose::GeneralPurposeConfig;
use base64::engine::{DecodePaddingMode, GeneralPurpose};
use base64::Engine;
use http_body_util::LengthLimitError;
use image::DynamicImage;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::error::DetectionError;
use crate::resolution::Resolution;

/// Topic reported when no source supplies one
pub const DEFAULT_TOPIC: &str = "unknown";

/// Base64 engine tolerant of missing padding
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Which recovery attempt produced the image bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeStrategy {
    /// Multipart file content was already an image
    Binary,
    /// Multipart file content was base64 text wrapping an image
    Base64,
    /// Payload was scraped out of the raw body text
    RawBody,
}

/// Where the source topic came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicSource {
    Json,
    FormField,
    RawBody,
    Query,
    Default,
}

/// A file part from a multipart body
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field_name: String,
    pub file_name: Option<String>,
    pub data: Bytes,
}

impl UploadedFile {
    /// Name the capture pipeline used for this file (field name, else filename)
    pub fn identifier(&self) -> &str {
        if self.field_name.is_empty() {
            self.file_name.as_deref().unwrap_or_default()
        } else {
            &self.field_name
        }
    }

    fn matches(&self, key: &str) -> bool {
        self.field_name.eq_ignore_ascii_case(key)
            || self
                .file_name
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(key))
    }
}

/// Image bytes recovered for one identifier
#[derive(Debug, Clone)]
pub struct RecoveredFrame {
    pub original_filename: String,
    pub bytes: Bytes,
    pub strategy: DecodeStrategy,
}

/// A fully decoded image
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub width: u32,
    pub height: u32,
    /// The encoded bytes the image was decoded from
    pub encoded: Bytes,
}

/// A buffered request body with whatever structure could be parsed out of it
#[derive(Debug, Default)]
pub struct RequestBody {
    pub files: Vec<UploadedFile>,
    pub fields: HashMap<String, String>,
    pub json: Option<serde_json::Value>,
    pub raw: Bytes,
}

impl RequestBody {
    /// Buffer the body, then parse it as multipart or JSON when possible.
    ///
    /// Parse failures are not errors: the raw bytes are kept for fallback scanning.
    pub async fn read(request: Request, limit: usize) -> Result<Self, DetectionError> {
        let (parts, body) = request.into_parts();

        let declared = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if let Some(length) = declared.filter(|length| *length > limit) {
            return Err(DetectionError::SizeLimitExceeded {
                actual_mb: length as f64 / (1024.0 * 1024.0),
                limit_mb: limit as f64 / (1024.0 * 1024.0),
            });
        }

        let raw = axum::body::to_bytes(body, limit)
            .await
            .map_err(|e| body_read_error(e, limit))?;

        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let mut parsed = RequestBody {
            raw: raw.clone(),
            ..Default::default()
        };

        if content_type.starts_with("multipart/") {
            let replay = Request::from_parts(parts, Body::from(raw));
            match Multipart::from_request(replay, &()).await {
                Ok(multipart) => parsed.collect_parts(multipart).await,
                Err(e) => debug!(error = %e, "Multipart parsing rejected body, keeping raw bytes"),
            }
        } else if content_type.starts_with("application/json") {
            match serde_json::from_slice(&parsed.raw) {
                Ok(value) => parsed.json = Some(value),
                Err(e) => debug!(error = %e, "JSON body did not parse"),
            }
        }

        Ok(parsed)
    }

    async fn collect_parts(&mut self, mut multipart: Multipart) {
        loop {
            let field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Multipart stream ended early, keeping parsed parts");
                    break;
                }
            };

            let field_name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().map(str::to_string);

            let data = match field.bytes().await {
                Ok(data) => data,
                Err(e) => {
                    warn!(field = %field_name, error = %e, "Failed to read multipart field");
                    break;
                }
            };

            if file_name.is_some() || Resolution::from_file_key(&field_name).is_some() {
                self.files.push(UploadedFile {
                    field_name,
                    file_name,
                    data,
                });
            } else {
                self.fields
                    .insert(field_name, String::from_utf8_lossy(&data).into_owned());
            }
        }
    }

    /// Raw body as text, with invalid UTF-8 replaced
    fn raw_text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

/// Map a failed body read, telling an over-limit body apart from a broken one
fn body_read_error(error: axum::Error, limit: usize) -> DetectionError {
    let inner = error.into_inner();

    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&*inner);
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            let limit_mb = limit as f64 / (1024.0 * 1024.0);
            // Reading stops at the limit, so the true size is unknown
            return DetectionError::SizeLimitExceeded {
                actual_mb: (limit + 1) as f64 / (1024.0 * 1024.0),
                limit_mb,
            };
        }
        source = cause.source();
    }

    DetectionError::InvalidRequest(format!("Failed to read body: {inner}"))
}

type Attempt = fn(&[u8]) -> Option<Bytes>;

/// Per-file attempts, in priority order
const FILE_ATTEMPTS: [(DecodeStrategy, Attempt); 2] = [
    (DecodeStrategy::Binary, attempt_binary),
    (DecodeStrategy::Base64, attempt_base64),
];

fn attempt_binary(data: &[u8]) -> Option<Bytes> {
    looks_like_image(data).then(|| Bytes::copy_from_slice(data))
}

fn attempt_base64(data: &[u8]) -> Option<Bytes> {
    let decoded = decode_base64_text(data)?;
    looks_like_image(&decoded).then(|| Bytes::from(decoded))
}

/// Strip whitespace and non-alphabet characters, then decode
fn decode_base64_text(data: &[u8]) -> Option<Vec<u8>> {
    let cleaned: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    LENIENT_BASE64.decode(cleaned).ok()
}

/// Header sniff only; does not decode pixels
pub fn looks_like_image(data: &[u8]) -> bool {
    !data.is_empty() && image::guess_format(data).is_ok()
}

/// Run the per-file attempts and report which one succeeded
pub fn recover_payload(data: &[u8]) -> Result<(Bytes, DecodeStrategy), DetectionError> {
    if data.is_empty() {
        return Err(DetectionError::DecodeFailure("empty file".to_string()));
    }

    FILE_ATTEMPTS
        .iter()
        .find_map(|(strategy, attempt)| attempt(data).map(|bytes| (bytes, *strategy)))
        .ok_or_else(|| {
            DetectionError::DecodeFailure(
                "content is neither a supported image nor base64-wrapped image".to_string(),
            )
        })
}

/// Fully decode image bytes
pub fn decode_image(bytes: &Bytes) -> Result<DecodedImage, DetectionError> {
    if bytes.is_empty() {
        return Err(DetectionError::DecodeFailure("empty image buffer".to_string()));
    }

    let image = image::load_from_memory(bytes)
        .map_err(|e| DetectionError::DecodeFailure(e.to_string()))?;

    Ok(DecodedImage {
        width: image.width(),
        height: image.height(),
        image,
        encoded: bytes.clone(),
    })
}

/// Outcome of recovering one batch identifier
#[derive(Debug)]
pub struct BatchEntry {
    pub identifier: String,
    pub payload: Result<RecoveredFrame, DetectionError>,
}

/// Stateless decoder for single and multi-resolution uploads
pub struct FrameDecoder;

impl FrameDecoder {
    /// Recover the three resolution files of a batch upload.
    ///
    /// Returns one entry per expected resolution plus one per extra image file
    /// (reported downstream as an unknown resolution). Corrupt content stays an
    /// entry-level error; only missing identifiers fail the whole call.
    pub fn decode_batch(body: &RequestBody) -> Result<Vec<BatchEntry>, Vec<DetectionError>> {
        let mut entries = Vec::with_capacity(Resolution::ALL.len());
        let mut missing = Vec::new();

        if body.files.is_empty() {
            let text = body.raw_text();
            for resolution in Resolution::ALL {
                match scan_raw_payload(&text, resolution.file_key()) {
                    Some(payload) => entries.push(BatchEntry {
                        identifier: resolution.file_key().to_string(),
                        payload: recover_raw(resolution.file_key(), &payload),
                    }),
                    None => missing.push(DetectionError::MissingInput(
                        resolution.file_key().to_string(),
                    )),
                }
            }
        } else {
            for resolution in Resolution::ALL {
                match body.files.iter().find(|f| f.matches(resolution.file_key())) {
                    Some(file) => entries.push(BatchEntry {
                        identifier: resolution.file_key().to_string(),
                        payload: recover_file(file),
                    }),
                    None => missing.push(DetectionError::MissingInput(
                        resolution.file_key().to_string(),
                    )),
                }
            }

            let extras = body.files.iter().filter(|f| {
                is_image_name(f.identifier())
                    && !Resolution::ALL.iter().any(|r| f.matches(r.file_key()))
            });
            for file in extras {
                entries.push(BatchEntry {
                    identifier: file.identifier().to_string(),
                    payload: recover_file(file),
                });
            }
        }

        if missing.is_empty() {
            Ok(entries)
        } else {
            Err(missing)
        }
    }

    /// Recover the single image of a one-file upload, whatever its field name
    pub fn decode_single(body: &RequestBody) -> Result<RecoveredFrame, DetectionError> {
        match body.files.first() {
            Some(file) => recover_file(file),
            None => Err(DetectionError::MissingInput("image file".to_string())),
        }
    }
}

fn recover_file(file: &UploadedFile) -> Result<RecoveredFrame, DetectionError> {
    let (bytes, strategy) = recover_payload(&file.data)?;

    if strategy != DecodeStrategy::Binary {
        debug!(identifier = %file.identifier(), strategy = ?strategy, "Recovered file via fallback");
    }

    Ok(RecoveredFrame {
        original_filename: file
            .file_name
            .clone()
            .unwrap_or_else(|| file.identifier().to_string()),
        bytes,
        strategy,
    })
}

fn recover_raw(key: &str, payload: &str) -> Result<RecoveredFrame, DetectionError> {
    let decoded = decode_base64_text(payload.as_bytes())
        .ok_or_else(|| DetectionError::DecodeFailure(format!("{key}: payload is not base64")))?;

    if !looks_like_image(&decoded) {
        return Err(DetectionError::DecodeFailure(format!(
            "{key}: decoded payload is not a supported image"
        )));
    }

    debug!(identifier = %key, size_bytes = decoded.len(), "Recovered file from raw body");

    Ok(RecoveredFrame {
        original_filename: key.to_string(),
        bytes: Bytes::from(decoded),
        strategy: DecodeStrategy::RawBody,
    })
}

fn is_image_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    [".png", ".jpg", ".jpeg", ".webp"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

/// Find the payload following a `name="<key>"` part header in raw body text.
///
/// The payload runs from the blank line after the part headers up to the next
/// boundary line or the end of the body.
fn scan_raw_payload(text: &str, key: &str) -> Option<String> {
    let pattern = format!(
        r#"name="{}"[^\r\n]*\r?\n(?:[^\r\n]+\r?\n)*\r?\n([\s\S]*?)(?:\r?\n--|$)"#,
        regex::escape(key)
    );
    let re = Regex::new(&pattern).ok()?;
    let payload = re.captures(text)?.get(1)?.as_str();

    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

fn raw_topic_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"name="topic"[^\r\n]*\r?\n(?:[^\r\n]+\r?\n)*\r?\n([^\r\n]+)"#)
            .expect("static topic pattern")
    })
}

type TopicAttempt = fn(&RequestBody, Option<&str>) -> Option<String>;

/// Topic sources, in priority order
const TOPIC_ATTEMPTS: [(TopicSource, TopicAttempt); 4] = [
    (TopicSource::Json, topic_from_json),
    (TopicSource::FormField, topic_from_form),
    (TopicSource::RawBody, topic_from_raw),
    (TopicSource::Query, topic_from_query),
];

fn topic_from_json(body: &RequestBody, _query: Option<&str>) -> Option<String> {
    body.json
        .as_ref()?
        .get("topic")?
        .as_str()
        .map(str::to_string)
}

fn topic_from_form(body: &RequestBody, _query: Option<&str>) -> Option<String> {
    body.fields.get("topic").cloned()
}

fn topic_from_raw(body: &RequestBody, _query: Option<&str>) -> Option<String> {
    if body.raw.is_empty() {
        return None;
    }
    let text = body.raw_text();
    raw_topic_pattern()
        .captures(&text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn topic_from_query(_body: &RequestBody, query: Option<&str>) -> Option<String> {
    query.map(str::to_string)
}

/// Resolve the source topic: JSON body, form field, raw body, query, default
pub fn extract_topic(body: &RequestBody, query_topic: Option<&str>) -> (String, TopicSource) {
    TOPIC_ATTEMPTS
        .iter()
        .find_map(|(source, attempt)| {
            attempt(body, query_topic)
                .map(|topic| topic.trim().to_string())
                .filter(|topic| !topic.is_empty())
                .map(|topic| (topic, *source))
        })
        .unwrap_or_else(|| (DEFAULT_TOPIC.to_string(), TopicSource::Default))
}
