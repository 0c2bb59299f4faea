//! Configuration management
//!
//! Includes smart CPU detection for optimal resource utilization.

use crate::telemetry::TelemetryMode;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Maximum input size accepted in bytes
    pub max_file_size: usize,
    /// Maximum source image resolution (width or height)
    pub max_resolution: u32,
    /// Maximum output surface area in pixels
    pub max_surface_pixels: u64,
    /// Quality used when the caller omits one (0-100)
    pub default_quality: u32,
    /// Number of jobs the worker runs concurrently
    pub worker_count: usize,
    /// Maximum pending jobs in queue
    pub queue_size: usize,
    /// Per-job timeout in seconds, 0 disables it
    pub job_timeout_secs: u64,
    /// AVIF encoder speed, 1 (slowest) to 10 (fastest)
    pub avif_speed: u8,
    /// Emit memory and speed telemetry with progress
    pub enhanced_telemetry: bool,
    /// Entries kept by the size estimate memo, 0 disables it
    pub estimate_cache_capacity: usize,
    /// Server port
    pub server_port: u16,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

/// Subset of the configuration the transcode worker needs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_resolution: u32,
    pub max_surface_pixels: u64,
    pub worker_count: usize,
    pub queue_size: usize,
    pub avif_speed: u8,
    pub telemetry: TelemetryMode,
}

/// Smart CPU detection for optimal worker configuration
///
/// Strategy:
/// - Detects available parallelism (logical cores)
/// - Reserves 1 core for I/O tasks if we have more than 4 cores
/// - Ensures minimum of 2 workers and maximum based on available parallelism
fn detect_optimal_workers() -> usize {
    let logical_cores = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4);

    let workers = if logical_cores > 4 {
        logical_cores - 1 // Reserve one for I/O
    } else {
        logical_cores
    };

    workers.max(2)
}

/// Queue should absorb bursts without holding too many input blobs in memory:
/// workers * 4, minimum 100
fn calculate_optimal_queue_size(worker_count: usize) -> usize {
    let base_queue = worker_count * 4;
    base_queue.max(100)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        let worker_count = detect_optimal_workers();
        Self {
            max_file_size: 50 * 1024 * 1024, // 50MB
            max_resolution: 16384,
            max_surface_pixels: 100_000_000,
            default_quality: 85,
            worker_count,
            queue_size: calculate_optimal_queue_size(worker_count),
            job_timeout_secs: 60,
            avif_speed: 8,
            enhanced_telemetry: false,
            estimate_cache_capacity: 64,
            server_port: 3000,
            request_timeout_secs: 120,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok(); // Load .env if present

        let defaults = Self::default();

        let worker_count = env_or("WORKER_COUNT", defaults.worker_count).max(1);

        // Queue size follows the worker count unless overridden
        let default_queue = calculate_optimal_queue_size(worker_count);

        Self {
            max_file_size: env_or("MAX_FILE_SIZE", defaults.max_file_size),
            max_resolution: env_or("MAX_RESOLUTION", defaults.max_resolution),
            max_surface_pixels: env_or("MAX_SURFACE_PIXELS", defaults.max_surface_pixels),
            default_quality: env_or("DEFAULT_QUALITY", defaults.default_quality),
            worker_count,
            queue_size: env_or("QUEUE_SIZE", default_queue).max(1),
            job_timeout_secs: env_or("JOB_TIMEOUT_SECS", defaults.job_timeout_secs),
            avif_speed: env_or("AVIF_SPEED", defaults.avif_speed).clamp(1, 10),
            enhanced_telemetry: env_or("ENHANCED_TELEMETRY", defaults.enhanced_telemetry),
            estimate_cache_capacity: env_or(
                "ESTIMATE_CACHE_CAPACITY",
                defaults.estimate_cache_capacity,
            ),
            server_port: env_or("SERVER_PORT", defaults.server_port),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            max_resolution: self.max_resolution,
            max_surface_pixels: self.max_surface_pixels,
            worker_count: self.worker_count,
            queue_size: self.queue_size,
            avif_speed: self.avif_speed,
            telemetry: if self.enhanced_telemetry {
                TelemetryMode::Enhanced
            } else {
                TelemetryMode::Basic
            },
        }
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        (self.job_timeout_secs > 0).then(|| Duration::from_secs(self.job_timeout_secs))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Config::default().engine()
    }
}
