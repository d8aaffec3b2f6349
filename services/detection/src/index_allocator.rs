use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::warn;

use crate::resolution::Resolution;

/// Largest index that fits the six-digit filename field
pub const MAX_INDEX: u32 = 999_999;

/// Maximum length of the sanitized instance prefix
const MAX_PREFIX_LEN: usize = 20;

/// Process-wide frame index counter and filename synthesis.
///
/// The raw counter is never exposed; callers only observe allocated indices.
/// Indices run `1..=999_999` and wrap back to 1.
pub struct IndexAllocator {
    counter: AtomicU32,
    rollovers: AtomicU64,
    prefix: String,
}

impl IndexAllocator {
    /// Create an allocator whose first index is 1
    pub fn new(instance_prefix: &str) -> Self {
        Self::starting_after(instance_prefix, 0)
    }

    /// Create an allocator whose next index follows `last`
    pub fn starting_after(instance_prefix: &str, last: u32) -> Self {
        Self {
            counter: AtomicU32::new(last.min(MAX_INDEX)),
            rollovers: AtomicU64::new(0),
            prefix: sanitize_prefix(instance_prefix),
        }
    }

    /// Atomically allocate the next index
    pub fn allocate(&self) -> u32 {
        let previous = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(if current >= MAX_INDEX { 1 } else { current + 1 })
            })
            .unwrap_or(MAX_INDEX);

        if previous >= MAX_INDEX {
            let rollovers = self.rollovers.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(previous = previous, rollovers = rollovers, "Frame index counter rolled over to 1");
            metrics::counter!("detector.index.rollovers").increment(1);
            1
        } else {
            previous + 1
        }
    }

    /// Times the counter has wrapped since this allocator was created
    pub fn rollovers(&self) -> u64 {
        self.rollovers.load(Ordering::Relaxed)
    }

    /// Sanitized instance prefix used in filenames
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Synthesize an indexed filename, allocating an index when none is given.
    ///
    /// Format: `{timestamp}_{prefix}_{index:06}_{resolution}.png`
    pub fn filename(&self, resolution: Resolution, index: Option<u32>) -> String {
        let index = index.unwrap_or_else(|| self.allocate());
        self.filename_at(Utc::now(), resolution, index)
    }

    /// Synthesize a filename for a fixed instant
    pub fn filename_at(&self, at: DateTime<Utc>, resolution: Resolution, index: u32) -> String {
        format!(
            "{timestamp}_{prefix}_{index:06}_{resolution}.png",
            timestamp = at.format("%Y%m%dT%H%M%S%3f"),
            prefix = self.prefix,
            index = index,
            resolution = resolution.label(),
        )
    }
}

/// Keep alphanumerics, dashes and underscores; cap at 20 characters
fn sanitize_prefix(prefix: &str) -> String {
    let sanitized: String = prefix
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .take(MAX_PREFIX_LEN)
        .collect();

    if sanitized.is_empty() {
        "instance".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use regex::Regex;
    use std::collections::HashSet;
    use std::io;
    use std::sync::Arc;

    /// In-memory log sink for asserting on emitted events
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[test]
    fn test_first_index_is_one() {
        let allocator = IndexAllocator::new("cam");
        assert_eq!(allocator.allocate(), 1);
        assert_eq!(allocator.allocate(), 2);
    }

    #[test]
    fn test_rollover_after_max() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let allocator = IndexAllocator::starting_after("cam", MAX_INDEX - 1);
        tracing::subscriber::with_default(subscriber, || {
            assert_eq!(allocator.allocate(), MAX_INDEX);
            assert_eq!(allocator.rollovers(), 0);
            assert!(logs.contents().is_empty());

            assert_eq!(allocator.allocate(), 1);
            assert_eq!(allocator.allocate(), 2);
        });

        assert_eq!(allocator.rollovers(), 1);
        let output = logs.contents();
        assert_eq!(output.matches("rolled over").count(), 1, "logs: {output}");
        assert!(output.contains("WARN"));
        assert!(output.contains("previous=999999"));
    }

    #[test]
    fn test_allocating_at_max_yields_one() {
        let allocator = IndexAllocator::starting_after("cam", MAX_INDEX);
        let next = allocator.allocate();
        assert_eq!(next, 1);
        assert_ne!(next, 0);
        assert_eq!(allocator.rollovers(), 1);
    }

    #[test]
    fn test_filename_format_for_all_resolutions() {
        let allocator = IndexAllocator::new("edge-node_01");
        let pattern =
            Regex::new(r"^\d{8}T\d{9}_[A-Za-z0-9_-]{1,20}_\d{6}_(256p|720p|1080p)\.png$").unwrap();

        for resolution in Resolution::ALL {
            let name = allocator.filename(resolution, None);
            assert!(pattern.is_match(&name), "unexpected filename {name}");
            assert!(name.ends_with(&format!("_{}.png", resolution.label())));
        }
    }

    #[test]
    fn test_filename_positional_fields() {
        let allocator = IndexAllocator::new("cam");
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        assert_eq!(
            allocator.filename_at(at, Resolution::R720, 42),
            "20240115T103045000_cam_000042_720p.png"
        );
    }

    #[test]
    fn test_filenames_unique_across_thousand_allocations() {
        let allocator = IndexAllocator::new("cam");
        let names: HashSet<String> = (0..1000)
            .map(|_| allocator.filename(Resolution::R256, None))
            .collect();
        assert_eq!(names.len(), 1000);
    }

    #[test]
    fn test_prefix_sanitization() {
        assert_eq!(sanitize_prefix("node 1/a"), "node_1_a");
        assert_eq!(sanitize_prefix("a-very-long-instance-name-here"), "a-very-long-instance");
        assert_eq!(sanitize_prefix(""), "instance");
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let allocator = Arc::new(IndexAllocator::new("cam"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || (0..500).map(|_| allocator.allocate()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for index in handle.join().unwrap() {
                assert!(seen.insert(index), "index {index} allocated twice");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
