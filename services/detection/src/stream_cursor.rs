//! Live and historical replay of persisted frames.
//!
//! A [`StreamCursor`] walks one resolution's records in creation order. It
//! fetches bounded pages of records strictly newer than its cursor, emits
//! them at a fixed frame rate and idles one interval when caught up. Every
//! session is closed after a fixed wall-clock budget. Dropping the cursor
//! (the client went away) ends polling immediately.

use axum::body::Body;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::DetectionError;
use crate::frame_store::{FrameRecord, FrameStore};
use crate::resolution::Resolution;

/// Multipart boundary between frames
pub const BOUNDARY: &str = "frame";

/// Content type of a stream response
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Timeout,
    ClientGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Init,
    Polling,
    Emitting,
    Closed(CloseReason),
}

pub struct StreamCursor {
    store: Arc<dyn FrameStore>,
    resolution: Resolution,
    cursor: DateTime<Utc>,
    buffer: VecDeque<FrameRecord>,
    state: CursorState,
    interval: Duration,
    deadline: Instant,
    batch_size: i64,
    emitted: u64,
}

impl StreamCursor {
    /// Resolve the starting cursor and begin a session.
    ///
    /// With no `start_time` the cursor sits just before the newest existing
    /// record, so that record is the first one emitted.
    pub async fn open(
        store: Arc<dyn FrameStore>,
        resolution: Resolution,
        start_time: Option<DateTime<Utc>>,
        config: &StreamConfig,
    ) -> Result<Self, DetectionError> {
        let cursor = match start_time {
            Some(start) => start,
            None => store
                .latest(resolution)
                .await
                .map_err(|e| DetectionError::Persistence(format!("{e:#}")))?
                .map(|record| record.created_at - ChronoDuration::microseconds(1))
                .unwrap_or_else(Utc::now),
        };

        metrics::counter!("detector.stream.sessions", "resolution" => resolution.label())
            .increment(1);
        info!(
            resolution = %resolution,
            cursor = %cursor.to_rfc3339(),
            historical = start_time.is_some(),
            "Stream session opened"
        );

        Ok(Self {
            store,
            resolution,
            cursor,
            buffer: VecDeque::new(),
            state: CursorState::Init,
            interval: config.frame_interval(),
            deadline: Instant::now() + config.session_timeout(),
            batch_size: config.batch_size,
            emitted: 0,
        })
    }

    pub fn cursor(&self) -> DateTime<Utc> {
        self.cursor
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Next record in creation order, or `None` once the session is closed
    pub async fn next_frame(&mut self) -> Option<FrameRecord> {
        loop {
            if let CursorState::Closed(_) = self.state {
                return None;
            }
            if Instant::now() >= self.deadline {
                self.close(CloseReason::Timeout);
                return None;
            }

            if !self.buffer.is_empty() {
                if self.emitted > 0 && !self.pace().await {
                    self.close(CloseReason::Timeout);
                    return None;
                }

                let record = self.buffer.pop_front()?;
                self.state = CursorState::Emitting;
                self.cursor = record.created_at;
                self.emitted += 1;
                metrics::counter!("detector.stream.frames_emitted", "resolution" => self.resolution.label())
                    .increment(1);
                return Some(record);
            }

            self.state = CursorState::Polling;
            match self
                .store
                .newer_than(self.resolution, self.cursor, self.batch_size)
                .await
            {
                Ok(records) if !records.is_empty() => {
                    debug!(resolution = %self.resolution, fetched = records.len(), "Stream page fetched");
                    self.buffer.extend(records);
                }
                Ok(_) => {
                    self.pace().await;
                }
                Err(e) => {
                    warn!(resolution = %self.resolution, error = %e, "Stream poll failed, retrying");
                    self.pace().await;
                }
            }
        }
    }

    /// Sleep one interval, cut short by the deadline. Returns false if the deadline hit.
    async fn pace(&self) -> bool {
        let wake = Instant::now() + self.interval;
        if wake >= self.deadline {
            tokio::time::sleep_until(self.deadline).await;
            return false;
        }
        tokio::time::sleep_until(wake).await;
        true
    }

    fn close(&mut self, reason: CloseReason) {
        self.state = CursorState::Closed(reason);
        info!(
            resolution = %self.resolution,
            reason = ?reason,
            emitted = self.emitted,
            "Stream session closed"
        );
    }

    /// Response body of framed records, terminated when the session closes
    pub fn into_body(self) -> Body {
        let frames = futures::stream::unfold(Some(self), |cursor| async move {
            let mut cursor = cursor?;
            match cursor.next_frame().await {
                Some(record) => Some((Ok::<_, Infallible>(frame_chunk(&record)), Some(cursor))),
                None => Some((Ok(Bytes::from(format!("--{BOUNDARY}--\r\n"))), None)),
            }
        });

        Body::from_stream(frames)
    }
}

impl Drop for StreamCursor {
    fn drop(&mut self) {
        if !matches!(self.state, CursorState::Closed(_)) {
            self.state = CursorState::Closed(CloseReason::ClientGone);
            info!(
                resolution = %self.resolution,
                emitted = self.emitted,
                "Stream client disconnected"
            );
        }
    }
}

/// One self-delimited multipart part carrying a record's annotated image
pub fn frame_chunk(record: &FrameRecord) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/png\r\nContent-Length: {}\r\nX-Frame-Id: {}\r\nX-Frame-Timestamp: {}\r\n\r\n",
        record.annotated_image.len(),
        record.id,
        record.created_at.to_rfc3339(),
    );

    let mut chunk = Vec::with_capacity(header.len() + record.annotated_image.len() + 2);
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(&record.annotated_image);
    chunk.extend_from_slice(b"\r\n");
    Bytes::from(chunk)
}

/// Parse a replay start time: RFC 3339, or a naive ISO 8601 date-time taken as UTC
pub fn parse_start_time(raw: &str) -> Result<DateTime<Utc>, DetectionError> {
    let raw = raw.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            DetectionError::InvalidRequest(format!(
                "Invalid start_time '{raw}': expected an ISO 8601 date-time"
            ))
        })
}
