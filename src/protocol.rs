//! Messages exchanged between the coordinator and the transcode worker
//!
//! Four shapes cross the boundary: `CONVERT` towards the worker, and
//! `PROGRESS`, `SUCCESS` and `ERROR` back from it. Every message carries the
//! job's correlation id.

use crate::format::OutputFormat;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation id of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller-facing conversion options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvertOptions {
    pub format: OutputFormat,
    /// 0-100, only meaningful for lossy formats. Out-of-range values are
    /// clamped rather than rejected.
    pub quality: u32,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

impl ConvertOptions {
    pub fn new(format: OutputFormat, quality: u32) -> Self {
        Self {
            format,
            quality,
            max_width: None,
            max_height: None,
        }
    }

    pub fn max_width(mut self, max_width: u32) -> Self {
        self.max_width = Some(max_width);
        self
    }

    pub fn max_height(mut self, max_height: u32) -> Self {
        self.max_height = Some(max_height);
        self
    }

    /// Quality as the 0.0-1.0 fraction encoders take, `None` for lossless formats
    pub fn quality_fraction(&self) -> Option<f32> {
        self.format
            .supports_quality()
            .then(|| self.quality.min(100) as f32 / 100.0)
    }
}

/// One job as handed to the worker. `input` is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub id: JobId,
    pub input: Bytes,
    pub mime_type: String,
    pub options: ConvertOptions,
}

impl ConversionRequest {
    pub fn new(id: JobId, input: Bytes, options: ConvertOptions) -> Self {
        Self {
            id,
            input,
            mime_type: options.format.mime_type().to_string(),
            options,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionProgress {
    pub id: JobId,
    pub progress: u8,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
    /// Pixels processed per millisecond
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_speed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub id: JobId,
    pub blob: Bytes,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    /// Wall-clock milliseconds
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_peak: Option<u64>,
}

/// Pipeline phase a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStage {
    Decode,
    CanvasCreate,
    Draw,
    Encode,
    /// Anything not attributable to a specific phase
    Conversion,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureStage::Decode => "decode",
            FailureStage::CanvasCreate => "canvas-create",
            FailureStage::Draw => "draw",
            FailureStage::Encode => "encode",
            FailureStage::Conversion => "conversion",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionFailure {
    pub id: JobId,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<FailureStage>,
}

/// Everything that crosses the worker boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    Convert(ConversionRequest),
    Progress(ConversionProgress),
    Success(ConversionResult),
    Error(ConversionFailure),
}

impl WorkerMessage {
    pub fn id(&self) -> JobId {
        match self {
            WorkerMessage::Convert(m) => m.id,
            WorkerMessage::Progress(m) => m.id,
            WorkerMessage::Success(m) => m.id,
            WorkerMessage::Error(m) => m.id,
        }
    }

    /// Success or Error; nothing follows a terminal message for the same id
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerMessage::Success(_) | WorkerMessage::Error(_))
    }
}
