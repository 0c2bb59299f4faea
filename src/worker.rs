//! Transcode worker for CPU-bound image conversion
//!
//! Jobs arrive on a bounded queue and run on the blocking thread pool. Every
//! message a job produces goes out on one shared event channel, tagged with
//! the job id; ordering across jobs is not guaranteed, ordering within a job
//! is.

use crate::config::EngineConfig;
use crate::converter::{self, Surface};
use crate::error::ConvertError;
use crate::planner::plan_dimensions_detailed;
use crate::protocol::{
    ConversionFailure, ConversionProgress, ConversionRequest, ConversionResult, FailureStage,
    JobId, WorkerMessage,
};
use crate::telemetry::{Buffer, JobTelemetry};
use bytes::Bytes;
use image::GenericImageView;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Progress checkpoints, strictly increasing through a successful job
pub mod checkpoint {
    pub const INITIALIZED: u8 = 5;
    pub const DECODED: u8 = 15;
    pub const SURFACE_CREATED: u8 = 30;
    pub const DRAWING: u8 = 40;
    pub const DRAWN: u8 = 60;
    pub const ENCODING: u8 = 70;
    pub const ENCODED: u8 = 90;
    pub const COMPLETE: u8 = 100;
}

/// A conversion job
pub struct Job {
    pub request: ConversionRequest,
    pub cancel: CancellationToken,
}

pub type EventReceiver = mpsc::UnboundedReceiver<WorkerMessage>;

/// Isolated worker that executes conversion jobs
pub struct TranscodeWorker {
    job_tx: mpsc::Sender<Job>,
    semaphore: Arc<Semaphore>,
}

impl TranscodeWorker {
    /// Start the worker; returns it with the stream of messages it emits
    pub fn spawn(config: &EngineConfig) -> (Self, EventReceiver) {
        let (job_tx, mut job_rx) = mpsc::channel::<Job>(config.queue_size.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(config.worker_count.max(1)));
        let settings = Arc::new(config.clone());

        let sem = semaphore.clone();
        tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                // Only pull the next job once a slot is free, so a busy
                // worker fills the queue and rejects new submissions.
                let permit = match sem.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };

                let settings = settings.clone();
                let events = event_tx.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    let id = job.request.id;
                    let job_events = events.clone();

                    let joined = tokio::task::spawn_blocking(move || {
                        run_job(&job.request, &job.cancel, &settings, &mut |message| {
                            // The coordinator may have gone away; nothing to report to
                            let _ = job_events.send(message);
                        });
                    })
                    .await;

                    if let Err(e) = joined {
                        warn!(job_id = %id, error = %e, "Conversion task aborted");
                        let _ = events.send(WorkerMessage::Error(ConversionFailure {
                            id,
                            error: e.to_string(),
                            stage: Some(FailureStage::Conversion),
                        }));
                    }
                });
            }
            debug!("Transcode worker stopped");
        });

        (Self { job_tx, semaphore }, event_rx)
    }

    /// Queue a job without waiting
    ///
    /// # Returns
    /// * `Err(ConvertError::QueueFull)` - Queue is full
    /// * `Err(ConvertError::WorkerUnavailable)` - Worker loop has stopped
    pub fn submit(&self, job: Job) -> Result<(), ConvertError> {
        self.job_tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => ConvertError::QueueFull,
            TrySendError::Closed(_) => {
                ConvertError::WorkerUnavailable("transcode worker stopped".to_string())
            }
        })
    }

    /// Free job slots right now
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Execute one job to completion, emitting progress and exactly one
/// terminal message through `emit`
///
/// Failures, including panics inside the codecs, end up as an `Error`
/// message; nothing escapes to the caller.
pub fn run_job(
    request: &ConversionRequest,
    cancel: &CancellationToken,
    config: &EngineConfig,
    emit: &mut dyn FnMut(WorkerMessage),
) {
    let id = request.id;
    let mut run = JobRun::new(id, config, cancel);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run.execute(request, &mut *emit)));

    let message = match outcome {
        Ok(Ok(result)) => {
            info!(
                job_id = %id,
                format = %request.options.format,
                width = result.width,
                height = result.height,
                size = result.size,
                duration_ms = result.duration,
                "Conversion complete"
            );
            WorkerMessage::Success(result)
        }
        Ok(Err(err)) => {
            // Cancellation interrupts a phase but is not a failure of it
            let stage = match err {
                ConvertError::Cancelled => FailureStage::Conversion,
                _ => err.stage().unwrap_or(run.stage),
            };
            warn!(job_id = %id, stage = %stage, error = %err, "Conversion failed");
            WorkerMessage::Error(ConversionFailure {
                id,
                error: err.detail(),
                stage: Some(stage),
            })
        }
        Err(payload) => {
            let error = panic_message(payload.as_ref());
            warn!(job_id = %id, stage = %run.stage, error = %error, "Conversion panicked");
            WorkerMessage::Error(ConversionFailure {
                id,
                error,
                stage: Some(run.stage),
            })
        }
    };

    emit(message);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "conversion panicked".to_string()
    }
}

/// State of one executing job
struct JobRun<'a> {
    id: JobId,
    config: &'a EngineConfig,
    cancel: &'a CancellationToken,
    telemetry: JobTelemetry,
    /// Phase blamed if the job fails without a more specific error
    stage: FailureStage,
    last_progress: u8,
}

impl<'a> JobRun<'a> {
    fn new(id: JobId, config: &'a EngineConfig, cancel: &'a CancellationToken) -> Self {
        Self {
            id,
            config,
            cancel,
            telemetry: JobTelemetry::start(config.telemetry),
            stage: FailureStage::Conversion,
            last_progress: 0,
        }
    }

    fn report(&mut self, emit: &mut dyn FnMut(WorkerMessage), progress: u8, stage: &str) {
        debug_assert!(progress >= self.last_progress);
        self.last_progress = progress;
        debug!(job_id = %self.id, progress, stage, "Conversion progress");

        let snapshot = self.telemetry.snapshot();
        emit(WorkerMessage::Progress(ConversionProgress {
            id: self.id,
            progress,
            stage: stage.to_string(),
            memory_usage: snapshot.memory_usage,
            processing_speed: snapshot.processing_speed,
        }));
    }

    fn ensure_live(&self) -> Result<(), ConvertError> {
        if self.cancel.is_cancelled() {
            Err(ConvertError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn execute(
        &mut self,
        request: &ConversionRequest,
        emit: &mut dyn FnMut(WorkerMessage),
    ) -> Result<ConversionResult, ConvertError> {
        let options = request.options;

        self.telemetry.hold(Buffer::Input, request.input.len() as u64);
        self.report(emit, checkpoint::INITIALIZED, "initializing");
        self.ensure_live()?;

        self.stage = FailureStage::Decode;
        let bitmap = converter::decode(&request.input, self.config.max_resolution)?;
        let (source_width, source_height) = bitmap.dimensions();
        self.telemetry.hold(Buffer::Bitmap, converter::bitmap_len(&bitmap));
        self.telemetry
            .add_pixels(u64::from(source_width) * u64::from(source_height));
        self.report(emit, checkpoint::DECODED, "decoded");
        self.ensure_live()?;

        let plan = plan_dimensions_detailed(
            source_width,
            source_height,
            options.max_width,
            options.max_height,
        );
        debug!(
            job_id = %self.id,
            source_width,
            source_height,
            width = plan.width,
            height = plan.height,
            scale = plan.scale_factor,
            "Planned output dimensions"
        );

        self.stage = FailureStage::CanvasCreate;
        let mut surface = Surface::create(plan.width, plan.height, self.config.max_surface_pixels)?;
        self.telemetry.hold(Buffer::Surface, surface.byte_len());
        self.report(emit, checkpoint::SURFACE_CREATED, "surface created");
        self.ensure_live()?;

        self.stage = FailureStage::Draw;
        self.report(emit, checkpoint::DRAWING, "drawing");
        surface.draw(&bitmap, plan.resampling())?;

        // Decoded bitmaps can be large; release as soon as drawing is done
        drop(bitmap);
        self.telemetry.release(Buffer::Bitmap);
        self.telemetry
            .add_pixels(u64::from(plan.width) * u64::from(plan.height));
        self.report(emit, checkpoint::DRAWN, "drawn");
        self.ensure_live()?;

        self.stage = FailureStage::Encode;
        self.report(emit, checkpoint::ENCODING, "encoding");
        let encoded = surface.encode(
            options.format,
            options.quality_fraction(),
            self.config.avif_speed,
        )?;
        drop(surface);
        self.telemetry.release(Buffer::Surface);
        self.telemetry.hold(Buffer::Encoded, encoded.len() as u64);
        self.report(emit, checkpoint::ENCODED, "encoded");
        self.ensure_live()?;

        self.stage = FailureStage::Conversion;
        let size = encoded.len() as u64;
        let decoded_size =
            u64::from(source_width) * u64::from(source_height) * 4;
        let compression_ratio = (size > 0).then(|| decoded_size as f64 / size as f64);

        self.report(emit, checkpoint::COMPLETE, "complete");

        Ok(ConversionResult {
            id: self.id,
            blob: Bytes::from(encoded),
            size,
            width: plan.width,
            height: plan.height,
            duration: self.telemetry.elapsed().as_millis() as u64,
            compression_ratio,
            memory_peak: self.telemetry.memory_peak(),
        })
    }
}
