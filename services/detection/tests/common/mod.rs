//! Shared fixtures for the HTTP tests

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use detection_service::config::{Config, ForwardingConfig, InferenceConfig};
use detection_service::detection_engine::{BoundingBox, Inference, InferenceParams};
use detection_service::frame_decoder::DecodedImage;
use detection_service::{
    create_router, AppState, DetectionBox, DetectionEngineClient, DetectionError, Detector,
    DispatchCoordinator, FrameStore, IndexAllocator, MemoryFrameStore, OutboundForwarder,
    SizeGuard,
};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::Arc;

pub const BOUNDARY: &str = "test-boundary-7MA4YWxk";

/// Reports one box covering the whole image
pub struct ScriptedDetector {
    labels: Vec<String>,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self {
            labels: vec!["person".to_string(), "forklift".to_string()],
        }
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    fn model_name(&self) -> &str {
        "scripted"
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
                class_id: 1,
                confidence: 0.9,
                bbox: BoundingBox {
                    x1: 0.0,
                    y1: 0.0,
                    x2: image.width as f32,
                    y2: image.height as f32,
                },
            }],
            annotated_image: image.encoded.clone(),
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryFrameStore>,
}

pub fn build_app() -> TestApp {
    build_app_with(Config::default())
}

pub fn build_app_with(config: Config) -> TestApp {
    let config = Arc::new(config);
    let store = Arc::new(MemoryFrameStore::new());

    let engine = DetectionEngineClient::spawn(
        Arc::new(ScriptedDetector::new()),
        InferenceParams::from(&InferenceConfig::default()),
        8,
    );
    let forwarder = OutboundForwarder::new(&ForwardingConfig::default()).unwrap();

    let coordinator = DispatchCoordinator::new(
        engine,
        Arc::new(IndexAllocator::new("itest")),
        SizeGuard::new(config.upload.max_upload_mb),
        Arc::new(forwarder),
        store.clone() as Arc<dyn FrameStore>,
        3,
        true,
    );

    let router = create_router(
        AppState {
            coordinator,
            config: config.clone(),
        },
        &config.api,
    );

    TestApp { router, store }
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([200, 100, 50]));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// One part of a multipart body; `filename` marks it as a file
pub struct Part<'a> {
    pub name: &'a str,
    pub filename: Option<&'a str>,
    pub data: Vec<u8>,
}

impl<'a> Part<'a> {
    pub fn file(name: &'a str, data: Vec<u8>) -> Self {
        Self {
            name,
            filename: Some(name),
            data,
        }
    }

    pub fn text(name: &'a str, value: &str) -> Self {
        Self {
            name,
            filename: None,
            data: value.as_bytes().to_vec(),
        }
    }
}

pub fn multipart_body(parts: &[Part<'_>]) -> Bytes {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part.filename {
            Some(filename) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        part.name, filename
                    )
                    .as_bytes(),
                );
            }
            None => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name)
                        .as_bytes(),
                );
            }
        }
        body.extend_from_slice(&part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Bytes::from(body)
}

pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={BOUNDARY}")
}
