use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ForwardingConfig;
use crate::resolution::Resolution;

/// Errors from pushing a frame downstream. Logged, never returned to clients.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Downstream returned HTTP {0}")]
    HttpStatus(u16),

    #[error("No forwarding endpoint configured for {0}")]
    NoEndpoint(Resolution),
}

/// An annotated frame bound for a downstream consumer
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub resolution: Resolution,
    pub source_topic: String,
    pub filename: String,
    pub annotated_image: Bytes,
}

/// Fire-and-forget destination for annotated frames
#[cfg_attr(test, mockall::automock)]
pub trait FrameSink: Send + Sync {
    /// Hand off a frame. Must not block and must not fail the caller.
    fn submit(&self, frame: OutboundFrame);
}

/// Pushes annotated frames to per-resolution HTTP endpoints
#[derive(Clone)]
pub struct OutboundForwarder {
    inner: Arc<ForwarderInner>,
}

struct ForwarderInner {
    client: reqwest::Client,
    enabled: bool,
    endpoints: HashMap<Resolution, String>,
    base_url: Option<String>,
}

impl OutboundForwarder {
    pub fn new(config: &ForwardingConfig) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        let mut endpoints = HashMap::new();
        for (label, url) in &config.endpoints {
            match label.parse::<Resolution>() {
                Ok(resolution) => {
                    endpoints.insert(resolution, url.clone());
                }
                Err(e) => warn!(label = %label, error = %e, "Ignoring forwarding endpoint"),
            }
        }

        Ok(Self {
            inner: Arc::new(ForwarderInner {
                client,
                enabled: config.enabled,
                endpoints,
                base_url: config.base_url.clone(),
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Per-resolution endpoint, else the legacy base URL with a `/<label>` suffix
    pub fn endpoint_for(&self, resolution: Resolution) -> Result<String, ForwardError> {
        if let Some(url) = self.inner.endpoints.get(&resolution) {
            return Ok(url.clone());
        }

        self.inner
            .base_url
            .as_deref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), resolution.label()))
            .ok_or(ForwardError::NoEndpoint(resolution))
    }

    /// POST the annotated PNG to the resolution's endpoint
    pub async fn forward(&self, frame: &OutboundFrame) -> Result<(), ForwardError> {
        let url = self.endpoint_for(frame.resolution)?;

        let response = self
            .inner
            .client
            .post(&url)
            .header(CONTENT_TYPE, "image/png")
            .header("X-Resolution", frame.resolution.label())
            .header("X-Source-Topic", frame.source_topic.as_str())
            .header("X-Filename", frame.filename.as_str())
            .body(frame.annotated_image.clone())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ForwardError::HttpStatus(response.status().as_u16()));
        }

        debug!(url = %url, resolution = %frame.resolution, "Frame forwarded");
        Ok(())
    }
}

impl FrameSink for OutboundForwarder {
    fn submit(&self, frame: OutboundFrame) {
        if !self.inner.enabled {
            return;
        }

        let forwarder = self.clone();
        tokio::spawn(async move {
            match forwarder.forward(&frame).await {
                Ok(()) => {
                    metrics::counter!("detector.forward.success", "resolution" => frame.resolution.label())
                        .increment(1);
                }
                Err(e) => {
                    metrics::counter!("detector.forward.failures", "resolution" => frame.resolution.label())
                        .increment(1);
                    warn!(
                        resolution = %frame.resolution,
                        filename = %frame.filename,
                        error = %e,
                        "Frame forwarding failed"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use tokio::sync::mpsc;

    fn config() -> ForwardingConfig {
        ForwardingConfig {
            enabled: true,
            ..Default::default()
        }
    }

    fn frame(resolution: Resolution) -> OutboundFrame {
        OutboundFrame {
            resolution,
            source_topic: "cam-1".to_string(),
            filename: "frame.png".to_string(),
            annotated_image: Bytes::from_static(b"png"),
        }
    }

    /// Serves `router` on an ephemeral local port and returns its base URL
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }

    /// 256p accepts, 720p is unavailable, 1080p answers too late
    async fn downstream() -> String {
        let router = Router::new()
            .route("/256p", post(|| async { StatusCode::OK }))
            .route("/720p", post(|| async { StatusCode::SERVICE_UNAVAILABLE }))
            .route(
                "/1080p",
                post(|| async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    StatusCode::OK
                }),
            );
        serve(router).await
    }

    fn forwarder_for(base_url: String) -> OutboundForwarder {
        let mut config = config();
        config.base_url = Some(base_url);
        config.timeout_ms = 100;
        OutboundForwarder::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_forward_delivers_to_downstream() {
        let forwarder = forwarder_for(downstream().await);
        forwarder.forward(&frame(Resolution::R256)).await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_reports_downstream_status() {
        let forwarder = forwarder_for(downstream().await);
        let err = forwarder.forward(&frame(Resolution::R720)).await.unwrap_err();
        assert!(matches!(err, ForwardError::HttpStatus(503)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_forward_times_out_slow_downstream() {
        let forwarder = forwarder_for(downstream().await);
        match forwarder.forward(&frame(Resolution::R1080)).await {
            Err(ForwardError::Request(e)) => assert!(e.is_timeout(), "got {e:?}"),
            other => panic!("expected a timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_forwards_in_background() {
        let (tx, mut rx) = mpsc::channel::<(String, String, String, Bytes)>(1);
        let router = Router::new()
            .route(
                "/720p",
                post(
                    |State(tx): State<mpsc::Sender<(String, String, String, Bytes)>>,
                     headers: HeaderMap,
                     body: Bytes| async move {
                        let header = |name: &str| {
                            headers
                                .get(name)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or_default()
                                .to_string()
                        };
                        let received = (
                            header("x-resolution"),
                            header("x-source-topic"),
                            header("x-filename"),
                            body,
                        );
                        tx.send(received).await.unwrap();
                        StatusCode::OK
                    },
                ),
            )
            .with_state(tx);

        let forwarder = forwarder_for(serve(router).await);
        forwarder.submit(frame(Resolution::R720));

        let (resolution, topic, filename, body) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("frame never reached downstream")
                .unwrap();
        assert_eq!(resolution, "720p");
        assert_eq!(topic, "cam-1");
        assert_eq!(filename, "frame.png");
        assert_eq!(body, Bytes::from_static(b"png"));
    }

    #[test]
    fn test_specific_endpoint_wins_over_base_url() {
        let mut config = config();
        config
            .endpoints
            .insert("720p".to_string(), "http://sink-720/frames".to_string());
        config.base_url = Some("http://legacy/".to_string());

        let forwarder = OutboundForwarder::new(&config).unwrap();
        assert_eq!(
            forwarder.endpoint_for(Resolution::R720).unwrap(),
            "http://sink-720/frames"
        );
        assert_eq!(
            forwarder.endpoint_for(Resolution::R256).unwrap(),
            "http://legacy/256p"
        );
    }

    #[test]
    fn test_no_endpoint_configured() {
        let forwarder = OutboundForwarder::new(&config()).unwrap();
        assert!(matches!(
            forwarder.endpoint_for(Resolution::R1080),
            Err(ForwardError::NoEndpoint(Resolution::R1080))
        ));
    }

    #[tokio::test]
    async fn test_forward_without_endpoint_fails_quietly() {
        let forwarder = OutboundForwarder::new(&config()).unwrap();
        let err = forwarder.forward(&frame(Resolution::R256)).await.unwrap_err();
        assert_eq!(err.to_string(), "No forwarding endpoint configured for 256p");
    }

    #[test]
    fn test_disabled_forwarder_ignores_frames() {
        let forwarder = OutboundForwarder::new(&ForwardingConfig::default()).unwrap();
        assert!(!forwarder.is_enabled());
        // No runtime here: a spawn would panic if submit tried to forward.
        forwarder.submit(frame(Resolution::R720));
    }

    #[test]
    fn test_http_status_display() {
        assert_eq!(ForwardError::HttpStatus(502).to_string(), "Downstream returned HTTP 502");
    }
}
