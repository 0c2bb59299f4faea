//! Output format registry

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Target encodings a job can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Webp,
    Avif,
    Png,
    Jpeg,
    Gif,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 5] = [
        OutputFormat::Webp,
        OutputFormat::Avif,
        OutputFormat::Png,
        OutputFormat::Jpeg,
        OutputFormat::Gif,
    ];

    /// Wire-level mime type handed to the encoder
    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Webp => "image/webp",
            OutputFormat::Avif => "image/avif",
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Gif => "image/gif",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Webp => "webp",
            OutputFormat::Avif => "avif",
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Gif => "gif",
        }
    }

    /// Whether the encoder honours a lossy quality setting
    pub fn supports_quality(self) -> bool {
        match self {
            OutputFormat::Webp | OutputFormat::Avif | OutputFormat::Jpeg => true,
            OutputFormat::Png | OutputFormat::Gif => false,
        }
    }

    /// Whether the encoded output can carry an alpha channel
    pub fn supports_alpha(self) -> bool {
        !matches!(self, OutputFormat::Jpeg)
    }

    pub fn name(self) -> &'static str {
        match self {
            OutputFormat::Webp => "webp",
            OutputFormat::Avif => "avif",
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Gif => "gif",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a string names no known output format
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown output format: {0}")]
pub struct UnknownFormat(pub String);

impl FromStr for OutputFormat {
    type Err = UnknownFormat;

    /// Accepts short names, extensions and mime types, case-insensitively
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let name = lowered.strip_prefix("image/").unwrap_or(&lowered);
        match name {
            "webp" => Ok(OutputFormat::Webp),
            "avif" => Ok(OutputFormat::Avif),
            "png" => Ok(OutputFormat::Png),
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "gif" => Ok(OutputFormat::Gif),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_support() {
        let lossy: Vec<_> = OutputFormat::ALL
            .iter()
            .filter(|f| f.supports_quality())
            .collect();
        assert_eq!(
            lossy,
            vec![&OutputFormat::Webp, &OutputFormat::Avif, &OutputFormat::Jpeg]
        );
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!("JPG".parse::<OutputFormat>(), Ok(OutputFormat::Jpeg));
        assert_eq!("image/webp".parse::<OutputFormat>(), Ok(OutputFormat::Webp));
        assert_eq!(" avif ".parse::<OutputFormat>(), Ok(OutputFormat::Avif));
        assert!("tiff".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_mime_roundtrips_through_parse() {
        for format in OutputFormat::ALL {
            assert_eq!(format.mime_type().parse::<OutputFormat>(), Ok(format));
        }
    }
}
