//! HTTP handlers exposing the transcoding engine

use crate::error::ConvertError;
use crate::format::OutputFormat;
use crate::protocol::ConvertOptions;
use crate::state::AppState;
use axum::{
    extract::{Multipart, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "img-transcode"
    }))
}

/// Fields accepted by the conversion endpoints
struct ConversionForm {
    file: Bytes,
    file_name: Option<String>,
    options: ConvertOptions,
}

fn parse_number(field: &str, value: &str) -> Result<u32, ConvertError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ConvertError::Validation(format!("Invalid {} value", field)))
}

fn positive(field: &str, value: u32) -> Result<u32, ConvertError> {
    if value == 0 {
        return Err(ConvertError::Validation(format!("{} must be positive", field)));
    }
    Ok(value)
}

/// Parse multipart form data with:
/// - `file`: input image (required)
/// - `format`: webp, avif, png, jpeg or gif (required)
/// - `quality`: 0-100 (optional, config default)
/// - `max_width`, `max_height`: positive bounds (optional)
async fn parse_form(state: &AppState, mut multipart: Multipart) -> Result<ConversionForm, ConvertError> {
    let mut file: Option<Bytes> = None;
    let mut file_name: Option<String> = None;
    let mut format: Option<OutputFormat> = None;
    let mut quality = state.config.default_quality;
    let mut max_width: Option<u32> = None;
    let mut max_height: Option<u32> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ConvertError::Validation(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ConvertError::Validation(e.to_string()))?;

                if data.len() > state.config.max_file_size {
                    return Err(ConvertError::FileTooLarge {
                        size: data.len(),
                        max: state.config.max_file_size,
                    });
                }

                file = Some(data);
            }
            "format" | "quality" | "max_width" | "max_height" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ConvertError::Validation(e.to_string()))?;

                match name.as_str() {
                    "format" => {
                        format = Some(
                            text.parse::<OutputFormat>()
                                .map_err(|e| ConvertError::Validation(e.to_string()))?,
                        )
                    }
                    // Out-of-range quality is clamped by the encoder, not rejected
                    "quality" => quality = parse_number("quality", &text)?,
                    "max_width" => {
                        max_width = Some(positive("max_width", parse_number("max_width", &text)?)?)
                    }
                    _ => {
                        max_height =
                            Some(positive("max_height", parse_number("max_height", &text)?)?)
                    }
                }
            }
            _ => {
                // Ignore unknown fields
            }
        }
    }

    let file = file.ok_or_else(|| ConvertError::Validation("Missing 'file' field".to_string()))?;
    let format =
        format.ok_or_else(|| ConvertError::Validation("Missing 'format' field".to_string()))?;

    Ok(ConversionForm {
        file,
        file_name,
        options: ConvertOptions {
            format,
            quality,
            max_width,
            max_height,
        },
    })
}

fn header_value(value: impl ToString) -> Result<HeaderValue, ConvertError> {
    HeaderValue::from_str(&value.to_string()).map_err(|e| ConvertError::Internal(e.to_string()))
}

/// Convert endpoint
///
/// Responds with the encoded image; dimensions and metrics travel in
/// `x-image-*` headers.
#[instrument(skip(state, multipart))]
pub async fn convert_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Response, ConvertError> {
    let form = parse_form(&state, multipart).await?;

    info!(
        file_name = ?form.file_name,
        size = form.file.len(),
        format = %form.options.format,
        quality = form.options.quality,
        max_width = ?form.options.max_width,
        max_height = ?form.options.max_height,
        "Processing conversion request"
    );

    let result = state
        .coordinator
        .convert(form.file, form.options, |progress| {
            debug!(job_id = %progress.id, progress = progress.progress, stage = %progress.stage, "Conversion progress");
        })
        .await?;

    // Millisecond timestamp keeps names numeric, unique and ordered
    let output_name = format!(
        "{}.{}",
        Utc::now().timestamp_millis(),
        form.options.format.extension()
    );

    info!(output_name = %output_name, size = result.size, duration_ms = result.duration, "Conversion complete");

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(form.options.format.mime_type()),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(format!("attachment; filename=\"{}\"", output_name))?,
    );
    headers.insert(HeaderName::from_static("x-image-width"), header_value(result.width)?);
    headers.insert(HeaderName::from_static("x-image-height"), header_value(result.height)?);
    headers.insert(HeaderName::from_static("x-duration-ms"), header_value(result.duration)?);
    if let Some(ratio) = result.compression_ratio {
        headers.insert(
            HeaderName::from_static("x-compression-ratio"),
            header_value(format!("{:.3}", ratio))?,
        );
    }
    if let Some(peak) = result.memory_peak {
        headers.insert(HeaderName::from_static("x-memory-peak"), header_value(peak)?);
    }

    Ok((StatusCode::OK, headers, result.blob).into_response())
}

/// Size estimate endpoint
#[instrument(skip(state, multipart))]
pub async fn estimate_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Response, ConvertError> {
    let form = parse_form(&state, multipart).await?;

    let size = state
        .coordinator
        .estimate_size(form.file, form.options)
        .await?;

    info!(format = %form.options.format, quality = form.options.quality, size, "Size estimated");

    Ok(Json(serde_json::json!({
        "size": size,
        "format": form.options.format,
        "quality": form.options.quality,
    }))
    .into_response())
}

/// Endpoint info
pub async fn info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let formats: Vec<_> = OutputFormat::ALL
        .iter()
        .map(|f| {
            serde_json::json!({
                "format": f,
                "mime_type": f.mime_type(),
                "extension": f.extension(),
                "supports_quality": f.supports_quality(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "endpoints": {
            "convert": "POST /api/convert",
            "estimate": "POST /api/estimate"
        },
        "fields": {
            "file": "Input image (required)",
            "format": "Output format (required)",
            "quality": format!("0-100 (optional, default {})", state.config.default_quality),
            "max_width": "Positive integer (optional)",
            "max_height": "Positive integer (optional)"
        },
        "formats": formats,
        "limits": {
            "max_file_size": format!("{}MB", state.config.max_file_size / 1024 / 1024),
            "max_resolution": format!("{}x{}", state.config.max_resolution, state.config.max_resolution),
            "job_timeout_secs": state.config.job_timeout_secs
        },
        "in_flight": state.coordinator.in_flight()
    }))
}
