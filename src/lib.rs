//! In-process image transcoding engine
//!
//! Decodes an input image, fits it inside optional bounds, and re-encodes it
//! as WebP, AVIF, PNG, JPEG or GIF on a worker pool, reporting progress and
//! metrics per job. [`Coordinator`] is the entry point; the `router` module
//! exposes it over HTTP.

pub mod config;
pub mod converter;
pub mod coordinator;
pub mod error;
pub mod format;
pub mod handlers;
pub mod planner;
pub mod protocol;
pub mod router;
pub mod state;
pub mod telemetry;
pub mod worker;

pub use config::{Config, EngineConfig};
pub use coordinator::Coordinator;
pub use error::{ConvertError, ErrorCode};
pub use format::OutputFormat;
pub use planner::{plan_dimensions, plan_dimensions_detailed, Dimensions, PlannedDimensions};
pub use protocol::{
    ConversionFailure, ConversionProgress, ConversionRequest, ConversionResult, ConvertOptions,
    FailureStage, JobId, WorkerMessage,
};
pub use telemetry::TelemetryMode;
