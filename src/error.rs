//! Error types for the transcoding engine

use crate::format::OutputFormat;
use crate::protocol::{ConversionFailure, FailureStage};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to create drawing surface: {0}")]
    Surface(String),

    #[error("Failed to draw image: {0}")]
    Draw(String),

    #[error("Failed to encode {format}: {message}")]
    Encode {
        format: OutputFormat,
        message: String,
    },

    #[error("Conversion timeout")]
    Timeout,

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("Queue full, try again later")]
    QueueFull,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("File too large: {size} bytes (max: {max} bytes)")]
    FileTooLarge { size: usize, max: usize },

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DecodeError,
    CanvasError,
    DrawError,
    EncodeError,
    TimeoutError,
    Cancelled,
    QueueFull,
    ValidationError,
    FileTooLarge,
    WorkerUnavailable,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::DecodeError => "DECODE_ERROR",
            ErrorCode::CanvasError => "CANVAS_ERROR",
            ErrorCode::DrawError => "DRAW_ERROR",
            ErrorCode::EncodeError => "ENCODE_ERROR",
            ErrorCode::TimeoutError => "TIMEOUT_ERROR",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ErrorCode::WorkerUnavailable => "WORKER_UNAVAILABLE",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl ConvertError {
    /// Map a worker failure into the caller's taxonomy.
    ///
    /// `format` is the job's target format, used to tag encode failures.
    pub fn from_failure(failure: ConversionFailure, format: OutputFormat) -> Self {
        let ConversionFailure { error, stage, .. } = failure;
        match stage {
            Some(FailureStage::Decode) => ConvertError::Decode(error),
            Some(FailureStage::CanvasCreate) => ConvertError::Surface(error),
            Some(FailureStage::Draw) => ConvertError::Draw(error),
            Some(FailureStage::Encode) => ConvertError::Encode {
                format,
                message: error,
            },
            Some(FailureStage::Conversion) | None => ConvertError::Internal(error),
        }
    }

    /// Pipeline phase this error belongs to, if any
    pub fn stage(&self) -> Option<FailureStage> {
        match self {
            ConvertError::Decode(_) => Some(FailureStage::Decode),
            ConvertError::Surface(_) => Some(FailureStage::CanvasCreate),
            ConvertError::Draw(_) => Some(FailureStage::Draw),
            ConvertError::Encode { .. } => Some(FailureStage::Encode),
            _ => None,
        }
    }

    /// Message without the variant prefix, as carried in a `ConversionFailure`
    pub fn detail(&self) -> String {
        match self {
            ConvertError::Decode(message)
            | ConvertError::Surface(message)
            | ConvertError::Draw(message)
            | ConvertError::Internal(message) => message.clone(),
            ConvertError::Encode { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ConvertError::Decode(_) => ErrorCode::DecodeError,
            ConvertError::Surface(_) => ErrorCode::CanvasError,
            ConvertError::Draw(_) => ErrorCode::DrawError,
            ConvertError::Encode { .. } => ErrorCode::EncodeError,
            ConvertError::Timeout => ErrorCode::TimeoutError,
            ConvertError::Cancelled => ErrorCode::Cancelled,
            ConvertError::QueueFull => ErrorCode::QueueFull,
            ConvertError::Validation(_) => ErrorCode::ValidationError,
            ConvertError::FileTooLarge { .. } => ErrorCode::FileTooLarge,
            ConvertError::WorkerUnavailable(_) => ErrorCode::WorkerUnavailable,
            ConvertError::Internal(_) => ErrorCode::UnknownError,
        }
    }

    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConvertError::Surface(_)
                | ConvertError::Timeout
                | ConvertError::QueueFull
                | ConvertError::WorkerUnavailable(_)
        )
    }

    /// Format to suggest when the requested one could not be produced
    pub fn fallback_format(&self) -> Option<OutputFormat> {
        match self {
            ConvertError::Encode { format, .. } => match format {
                OutputFormat::Avif | OutputFormat::Webp | OutputFormat::Gif => {
                    Some(OutputFormat::Png)
                }
                OutputFormat::Png => Some(OutputFormat::Jpeg),
                OutputFormat::Jpeg => None,
            },
            _ => None,
        }
    }
}

impl IntoResponse for ConvertError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ConvertError::Decode(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ConvertError::Surface(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            ConvertError::Draw(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            ConvertError::Encode { .. } => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            ConvertError::Timeout => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            ConvertError::Cancelled => (StatusCode::CONFLICT, self.to_string()),
            ConvertError::QueueFull => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ConvertError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ConvertError::FileTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ConvertError::WorkerUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            ConvertError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            ),
        };

        let mut body = serde_json::json!({
            "error": message,
            "code": self.code(),
            "retryable": self.is_retryable(),
        });
        if let Some(fallback) = self.fallback_format() {
            body["fallback_format"] = serde_json::json!(fallback);
        }

        (status, Json(body)).into_response()
    }
}
