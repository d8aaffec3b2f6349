//! Nier Detection Service
//!
//! Multi-resolution object detection for the Nier factory floor analytics
//! platform. Cameras upload the same frame at 256p, 720p and 1080p; the
//! service recovers each image from whatever shape the upload arrived in,
//! runs it through the detection engine, names it with a global index,
//! forwards the annotated frame downstream, and records it in PostgreSQL
//! for listing and live replay.
//!
//! ## Features
//!
//! - **Tolerant Upload Decoding**: Multipart files, base64-wrapped files and
//!   raw bodies that no multipart parser accepts
//! - **Concurrent Fan-out**: One task per resolution, partial success reported
//!   per entry with a single correlation id
//! - **Serialized Inference**: A single engine consumer, safe for backends that
//!   cannot run two requests at once
//! - **Live Replay**: `multipart/x-mixed-replace` streams paced at a target
//!   frame rate, optionally starting from a point in the past
//!
//! ## Architecture
//!
//! ```text
//!  HTTP upload              Detection Engine            PostgreSQL
//! ┌──────────────┐         ┌──────────────┐          ┌──────────────┐
//! │ Frame        │         │ mpsc queue   │          │ frame_records│
//! │ Decoder      │         │  (1 consumer)│          └──────────────┘
//! └──────────────┘         └──────────────┘            ▲        │
//!        │                        ▲                    │        │
//!        ▼                        │                    │        ▼
//! ┌──────────────┐                │                    │  ┌──────────────┐
//! │ Dispatch     │────────────────┘                    │  │ Stream       │
//! │ Coordinator  │─────────────────────────────────────┘  │ Cursor       │
//! └──────────────┘                                        └──────────────┘
//!        │                                                       │
//!        ▼                                                       ▼
//! ┌──────────────┐                                        ┌──────────────┐
//! │ Outbound     │                                        │ multipart    │
//! │ Forwarder    │                                        │ stream       │
//! └──────────────┘                                        └──────────────┘
//! ```

pub mod annotate;
pub mod api;
pub mod config;
pub mod detection_engine;
pub mod dispatch;
pub mod error;
pub mod forwarder;
pub mod frame_decoder;
pub mod frame_store;
pub mod index_allocator;
pub mod resolution;
pub mod size_guard;
pub mod stream_cursor;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use detection_engine::{DetectionBox, DetectionEngineClient, Detector, RemoteDetector};
pub use dispatch::{BatchOutcome, BatchStatus, DispatchCoordinator, ResolutionResult};
pub use error::DetectionError;
pub use forwarder::{FrameSink, OutboundForwarder};
pub use frame_decoder::{FrameDecoder, RequestBody};
pub use frame_store::{FrameRecord, FrameStore, MemoryFrameStore, PgFrameStore};
pub use index_allocator::IndexAllocator;
pub use resolution::Resolution;
pub use size_guard::SizeGuard;
pub use stream_cursor::StreamCursor;
