use crate::error::DetectionError;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Upload size ceiling, checked before any image decode work
#[derive(Debug, Clone, Copy)]
pub struct SizeGuard {
    limit_bytes: usize,
    limit_mb: f64,
}

impl SizeGuard {
    pub fn new(limit_mb: f64) -> Self {
        Self {
            limit_bytes: (limit_mb * BYTES_PER_MB) as usize,
            limit_mb,
        }
    }

    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    pub fn check(&self, byte_length: usize) -> Result<(), DetectionError> {
        if byte_length > self.limit_bytes {
            metrics::counter!("detector.uploads.rejected_size").increment(1);
            return Err(DetectionError::SizeLimitExceeded {
                actual_mb: byte_length as f64 / BYTES_PER_MB,
                limit_mb: self.limit_mb,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_limit_is_accepted() {
        let guard = SizeGuard::new(1.0);
        assert!(guard.check(1024 * 1024).is_ok());
        assert!(guard.check(0).is_ok());
    }

    #[test]
    fn test_one_byte_over_is_rejected() {
        let guard = SizeGuard::new(1.0);
        match guard.check(1024 * 1024 + 1) {
            Err(DetectionError::SizeLimitExceeded { actual_mb, limit_mb }) => {
                assert!(actual_mb > 1.0);
                assert_eq!(limit_mb, 1.0);
            }
            other => panic!("expected SizeLimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_fractional_limit() {
        let guard = SizeGuard::new(0.5);
        assert_eq!(guard.limit_bytes(), 512 * 1024);
    }
}
