//! Per-job instrumentation
//!
//! The worker always keeps a `JobTelemetry`; in `Basic` mode the snapshot
//! fields stay empty, in `Enhanced` mode progress messages carry the current
//! working-set size and throughput and the result carries the memory peak.
//!
//! Memory is accounted from the buffers the job owns (input, decoded bitmap,
//! surface, encoded output) rather than sampled from the allocator, so it is
//! deterministic across platforms.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TelemetryMode {
    #[default]
    Basic,
    Enhanced,
}

/// Named buffers tracked by the working-set accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffer {
    Input,
    Bitmap,
    Surface,
    Encoded,
}

impl Buffer {
    fn slot(self) -> usize {
        match self {
            Buffer::Input => 0,
            Buffer::Bitmap => 1,
            Buffer::Surface => 2,
            Buffer::Encoded => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Snapshot {
    pub memory_usage: Option<u64>,
    pub processing_speed: Option<f64>,
}

#[derive(Debug)]
pub struct JobTelemetry {
    mode: TelemetryMode,
    started: Instant,
    held: [u64; 4],
    peak: u64,
    pixels: u64,
}

impl JobTelemetry {
    pub fn start(mode: TelemetryMode) -> Self {
        Self {
            mode,
            started: Instant::now(),
            held: [0; 4],
            peak: 0,
            pixels: 0,
        }
    }

    pub fn mode(&self) -> TelemetryMode {
        self.mode
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn hold(&mut self, buffer: Buffer, bytes: u64) {
        self.held[buffer.slot()] = bytes;
        self.peak = self.peak.max(self.current());
    }

    pub fn release(&mut self, buffer: Buffer) {
        self.held[buffer.slot()] = 0;
    }

    pub fn held(&self, buffer: Buffer) -> u64 {
        self.held[buffer.slot()]
    }

    /// Record pixels pushed through a stage, for the throughput figure
    pub fn add_pixels(&mut self, pixels: u64) {
        self.pixels = self.pixels.saturating_add(pixels);
    }

    pub fn current(&self) -> u64 {
        self.held.iter().sum()
    }

    pub fn peak(&self) -> u64 {
        self.peak
    }

    pub fn snapshot(&self) -> Snapshot {
        match self.mode {
            TelemetryMode::Basic => Snapshot::default(),
            TelemetryMode::Enhanced => Snapshot {
                memory_usage: Some(self.current()),
                processing_speed: Some(self.speed()),
            },
        }
    }

    /// Peak working set, reported only in enhanced mode
    pub fn memory_peak(&self) -> Option<u64> {
        (self.mode == TelemetryMode::Enhanced).then_some(self.peak)
    }

    fn speed(&self) -> f64 {
        let millis = self.elapsed().as_secs_f64() * 1000.0;
        if millis > 0.0 {
            self.pixels as f64 / millis
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_survives_release() {
        let mut telemetry = JobTelemetry::start(TelemetryMode::Enhanced);
        telemetry.hold(Buffer::Input, 100);
        telemetry.hold(Buffer::Bitmap, 4000);
        telemetry.hold(Buffer::Surface, 1000);
        telemetry.release(Buffer::Bitmap);
        telemetry.hold(Buffer::Encoded, 50);

        assert_eq!(telemetry.current(), 1150);
        assert_eq!(telemetry.peak(), 5100);
        assert_eq!(telemetry.memory_peak(), Some(5100));
    }

    #[test]
    fn test_basic_mode_reports_nothing() {
        let mut telemetry = JobTelemetry::start(TelemetryMode::Basic);
        telemetry.hold(Buffer::Input, 10);
        telemetry.add_pixels(100);
        assert_eq!(telemetry.snapshot(), Snapshot::default());
        assert_eq!(telemetry.memory_peak(), None);
    }

    #[test]
    fn test_enhanced_snapshot() {
        let mut telemetry = JobTelemetry::start(TelemetryMode::Enhanced);
        telemetry.hold(Buffer::Surface, 64);
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.memory_usage, Some(64));
        assert!(snapshot.processing_speed.unwrap() >= 0.0);
    }
}
