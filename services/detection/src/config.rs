use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::resolution::Resolution;

/// Main configuration for the detection service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Detection engine configuration
    #[serde(default)]
    pub inference: InferenceConfig,
    /// Upload limits
    #[serde(default)]
    pub upload: UploadConfig,
    /// Indexed filename configuration
    #[serde(default)]
    pub naming: NamingConfig,
    /// Batch fan-out configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Persistence switch
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Downstream forwarding configuration
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    /// Live stream configuration
    #[serde(default)]
    pub stream: StreamConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Detection engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Base URL of the inference backend
    #[serde(default = "default_inference_endpoint")]
    pub endpoint: String,
    /// Model label reported by /health and /info
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// Minimum confidence for a detection to be reported
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// IoU threshold for non-maximum suppression
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    /// Maximum detections per image
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    /// Timeout for a single inference call in seconds
    #[serde(default = "default_inference_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Pending inference jobs before callers wait
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

/// Upload limits
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Maximum size of a single image in megabytes
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: f64,
}

/// Indexed filename configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NamingConfig {
    /// Instance prefix embedded in every indexed filename
    #[serde(default = "default_instance_prefix")]
    pub instance_prefix: String,
}

/// Batch fan-out configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Maximum concurrent per-resolution workers in one batch
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

/// Persistence switch
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Write frame records after processing
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; records stay in memory when unset
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Downstream forwarding configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardingConfig {
    /// Push annotated frames downstream
    #[serde(default)]
    pub enabled: bool,
    /// Per-resolution endpoints keyed by label (`256p`, `720p`, `1080p`)
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    /// Legacy single endpoint; the resolution label is appended as a path suffix
    pub base_url: Option<String>,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_forward_timeout_ms")]
    pub timeout_ms: u64,
}

/// Live stream configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Emission rate in frames per second
    #[serde(default = "default_target_fps")]
    pub target_fps: f32,
    /// Hard upper bound on one stream connection in seconds
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Records fetched per poll
    #[serde(default = "default_stream_batch_size")]
    pub batch_size: i64,
}

// Default value functions
fn default_service_name() -> String {
    "detection-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_inference_endpoint() -> String {
    "http://localhost:9000".to_string()
}

fn default_model_name() -> String {
    "YOLO12-nano".to_string()
}

fn default_confidence_threshold() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_max_detections() -> usize {
    300
}

fn default_inference_timeout_secs() -> u64 {
    30
}

fn default_queue_depth() -> usize {
    32
}

fn default_max_upload_mb() -> f64 {
    10.0
}

fn default_instance_prefix() -> String {
    "detector".to_string()
}

fn default_max_workers() -> usize {
    3
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_forward_timeout_ms() -> u64 {
    2000
}

fn default_target_fps() -> f32 {
    5.0
}

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_stream_batch_size() -> i64 {
    10
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/detector").required(false))
            .add_source(config::File::with_name("/etc/detector/detector").required(false))
            // DETECTOR__INFERENCE__CONFIDENCE_THRESHOLD -> inference.confidence_threshold
            .add_source(
                config::Environment::with_prefix("DETECTOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.inference.confidence_threshold),
            "inference.confidence_threshold must be within [0, 1]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.inference.iou_threshold),
            "inference.iou_threshold must be within [0, 1]"
        );
        anyhow::ensure!(self.upload.max_upload_mb > 0.0, "upload.max_upload_mb must be positive");
        anyhow::ensure!(self.stream.target_fps > 0.0, "stream.target_fps must be positive");
        anyhow::ensure!(self.stream.batch_size > 0, "stream.batch_size must be positive");
        anyhow::ensure!(self.dispatch.max_workers > 0, "dispatch.max_workers must be positive");

        for label in self.forwarding.endpoints.keys() {
            label
                .parse::<Resolution>()
                .map_err(|e| anyhow::anyhow!("forwarding.endpoints: {e}"))?;
        }

        Ok(())
    }

    /// Request body ceiling: three images plus multipart framing overhead
    pub fn max_body_bytes(&self) -> usize {
        (self.upload.max_upload_mb * 1024.0 * 1024.0 * 4.0) as usize
    }
}

impl StreamConfig {
    /// Sleep between emitted frames
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_fps))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_inference_endpoint(),
            model_name: default_model_name(),
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_iou_threshold(),
            max_detections: default_max_detections(),
            request_timeout_secs: default_inference_timeout_secs(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            instance_prefix: default_instance_prefix(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoints: HashMap::new(),
            base_url: None,
            timeout_ms: default_forward_timeout_ms(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            session_timeout_secs: default_session_timeout_secs(),
            batch_size: default_stream_batch_size(),
        }
    }
}
