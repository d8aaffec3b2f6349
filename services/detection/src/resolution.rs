use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DetectionError;

/// Rendition of a captured frame.
///
/// Frames are resized upstream; the dimensions here are bookkeeping only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "256p")]
    R256,
    #[serde(rename = "720p")]
    R720,
    #[serde(rename = "1080p")]
    R1080,
}

impl Resolution {
    /// All resolutions in ascending order
    pub const ALL: [Resolution; 3] = [Resolution::R256, Resolution::R720, Resolution::R1080];

    /// Label used in filenames, records and URLs (e.g. `720p`)
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::R256 => "256p",
            Resolution::R720 => "720p",
            Resolution::R1080 => "1080p",
        }
    }

    /// Multipart file identifier the capture pipeline uses for this rendition
    pub fn file_key(&self) -> &'static str {
        match self {
            Resolution::R256 => "256.png",
            Resolution::R720 => "720.png",
            Resolution::R1080 => "1080.png",
        }
    }

    /// Nominal (width, height) of the rendition
    pub fn target_dimensions(&self) -> (u32, u32) {
        match self {
            Resolution::R256 => (256, 256),
            Resolution::R720 => (1280, 720),
            Resolution::R1080 => (1920, 1080),
        }
    }

    /// Match a multipart file identifier (`256.png`) to a resolution
    pub fn from_file_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.file_key().eq_ignore_ascii_case(key.trim()))
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Resolution {
    type Err = DetectionError;

    /// Accepts `720p`, `720` or `720.png`, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let stem = normalized
            .strip_suffix(".png")
            .or_else(|| normalized.strip_suffix('p'))
            .unwrap_or(&normalized);

        match stem {
            "256" => Ok(Resolution::R256),
            "720" => Ok(Resolution::R720),
            "1080" => Ok(Resolution::R1080),
            _ => Err(DetectionError::UnknownResolution(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_all_forms() {
        assert_eq!("720p".parse::<Resolution>().unwrap(), Resolution::R720);
        assert_eq!("720".parse::<Resolution>().unwrap(), Resolution::R720);
        assert_eq!("1080.PNG".parse::<Resolution>().unwrap(), Resolution::R1080);
        assert_eq!(" 256P ".parse::<Resolution>().unwrap(), Resolution::R256);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(matches!(
            "480p".parse::<Resolution>(),
            Err(DetectionError::UnknownResolution(_))
        ));
        assert!("".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_file_key_lookup() {
        assert_eq!(Resolution::from_file_key("256.png"), Some(Resolution::R256));
        assert_eq!(Resolution::from_file_key("image"), None);
        for resolution in Resolution::ALL {
            assert_eq!(Resolution::from_file_key(resolution.file_key()), Some(resolution));
        }
    }

    #[test]
    fn test_serialization_uses_label() {
        assert_eq!(serde_json::to_string(&Resolution::R1080).unwrap(), "\"1080p\"");
    }
}
