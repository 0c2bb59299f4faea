//! Conversion coordinator
//!
//! Front door of the engine. Dispatches one job per input to the transcode
//! worker and routes the worker's messages back to the right caller by job
//! id. Messages for ids that are not outstanding are dropped.

use crate::config::{Config, EngineConfig};
use crate::error::ConvertError;
use crate::protocol::{
    ConversionProgress, ConversionRequest, ConversionResult, ConvertOptions, JobId, WorkerMessage,
};
use crate::worker::{Job, TranscodeWorker};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outstanding jobs, keyed by correlation id
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: Mutex<HashMap<JobId, mpsc::UnboundedSender<WorkerMessage>>>,
}

impl JobTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, mpsc::UnboundedSender<WorkerMessage>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking `id`; messages routed to it arrive on the returned receiver
    pub fn register(&self, id: JobId) -> mpsc::UnboundedReceiver<WorkerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id, tx);
        rx
    }

    /// Stop tracking `id`. Returns whether it was still outstanding.
    pub fn retire(&self, id: JobId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Deliver a worker message to its job. A terminal message retires the id.
    ///
    /// Returns `false` when the message was discarded.
    pub fn route(&self, message: WorkerMessage) -> bool {
        let id = message.id();
        if matches!(message, WorkerMessage::Convert(_)) {
            debug!(job_id = %id, "Ignoring request echoed by the worker");
            return false;
        }

        let mut jobs = self.lock();
        let delivered = if message.is_terminal() {
            jobs.remove(&id)
                .map(|tx| tx.send(message).is_ok())
                .unwrap_or(false)
        } else {
            jobs.get(&id)
                .map(|tx| tx.send(message).is_ok())
                .unwrap_or(false)
        };

        if !delivered {
            debug!(job_id = %id, "Discarding message for unknown or retired job");
        }
        delivered
    }

    /// Drop every outstanding job; their callers observe a closed channel
    pub fn close_all(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Retires a job id however the caller's wait ends, including when the
/// `convert` future is dropped.
struct RetireGuard<'a> {
    jobs: &'a JobTable,
    id: JobId,
    cancel: CancellationToken,
}

impl Drop for RetireGuard<'_> {
    fn drop(&mut self) {
        if self.jobs.retire(self.id) {
            // Still outstanding: tell the worker to stop at its next checkpoint
            self.cancel.cancel();
        }
    }
}

/// Inputs held by the estimate memo, summed across entries
const ESTIMATE_CACHE_MAX_BYTES: usize = 256 * 1024 * 1024;

/// Memo key. Holds the input itself so a hit always means identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EstimateKey {
    input: Bytes,
    options: ConvertOptions,
}

impl EstimateKey {
    fn new(input: Bytes, options: ConvertOptions) -> Self {
        Self { input, options }
    }
}

/// Bounded FIFO memo of estimated sizes
#[derive(Debug)]
struct EstimateCache {
    capacity: usize,
    max_bytes: usize,
    held_bytes: usize,
    sizes: HashMap<EstimateKey, u64>,
    order: VecDeque<EstimateKey>,
}

impl EstimateCache {
    fn new(capacity: usize) -> Self {
        Self::with_byte_budget(capacity, ESTIMATE_CACHE_MAX_BYTES)
    }

    fn with_byte_budget(capacity: usize, max_bytes: usize) -> Self {
        Self {
            capacity,
            max_bytes,
            held_bytes: 0,
            sizes: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    fn get(&self, key: &EstimateKey) -> Option<u64> {
        self.sizes.get(key).copied()
    }

    fn insert(&mut self, key: EstimateKey, size: u64) {
        let len = key.input.len();
        if self.capacity == 0 || len > self.max_bytes {
            return;
        }
        if self.sizes.insert(key.clone(), size).is_none() {
            self.held_bytes += len;
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity || self.held_bytes > self.max_bytes {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.sizes.remove(&oldest);
                    self.held_bytes -= oldest.input.len();
                }
                None => break,
            }
        }
    }
}

struct Inner {
    engine: EngineConfig,
    job_timeout: Option<Duration>,
    worker: OnceCell<TranscodeWorker>,
    jobs: Arc<JobTable>,
    estimates: Mutex<EstimateCache>,
}

/// Main-task facade over the transcode worker
///
/// Cheap to clone; clones share the worker and the job table.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: &Config) -> Self {
        Self::with_engine(
            config.engine(),
            config.job_timeout(),
            config.estimate_cache_capacity,
        )
    }

    pub fn with_engine(
        engine: EngineConfig,
        job_timeout: Option<Duration>,
        estimate_cache_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                job_timeout,
                worker: OnceCell::new(),
                jobs: Arc::new(JobTable::default()),
                estimates: Mutex::new(EstimateCache::new(estimate_cache_capacity)),
            }),
        }
    }

    /// Number of jobs dispatched and not yet finished
    pub fn in_flight(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Whether the worker has been started
    pub fn is_started(&self) -> bool {
        self.inner.worker.initialized()
    }

    async fn worker(&self) -> &TranscodeWorker {
        self.inner
            .worker
            .get_or_init(|| async {
                let (worker, mut events) = TranscodeWorker::spawn(&self.inner.engine);
                let jobs = self.inner.jobs.clone();
                tokio::spawn(async move {
                    while let Some(message) = events.recv().await {
                        jobs.route(message);
                    }
                    jobs.close_all();
                });
                debug!(
                    workers = self.inner.engine.worker_count,
                    "Transcode worker started"
                );
                worker
            })
            .await
    }

    /// Convert one input, reporting progress through `on_progress`
    pub async fn convert<F>(
        &self,
        input: Bytes,
        options: ConvertOptions,
        on_progress: F,
    ) -> Result<ConversionResult, ConvertError>
    where
        F: FnMut(&ConversionProgress),
    {
        self.convert_with_cancel(input, options, on_progress, CancellationToken::new())
            .await
    }

    /// Like [`Coordinator::convert`], abandoning the job once `cancel` fires
    ///
    /// A cancelled or timed-out id is retired immediately; anything the worker
    /// still sends for it is discarded.
    pub async fn convert_with_cancel<F>(
        &self,
        input: Bytes,
        options: ConvertOptions,
        mut on_progress: F,
        cancel: CancellationToken,
    ) -> Result<ConversionResult, ConvertError>
    where
        F: FnMut(&ConversionProgress),
    {
        if cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }

        let worker = self.worker().await;
        let id = JobId::new();
        let job_cancel = cancel.child_token();

        let mut messages = self.inner.jobs.register(id);
        let _guard = RetireGuard {
            jobs: &self.inner.jobs,
            id,
            cancel: job_cancel.clone(),
        };

        debug!(job_id = %id, format = %options.format, size = input.len(), "Dispatching conversion");
        worker.submit(Job {
            request: ConversionRequest::new(id, input, options),
            cancel: job_cancel,
        })?;

        let watch = cancel.clone();
        let wait = async move {
            let mut last_progress = 0;
            while let Some(message) = messages.recv().await {
                match message {
                    WorkerMessage::Progress(progress) => {
                        if progress.progress < last_progress {
                            debug!(job_id = %id, progress = progress.progress, "Dropping out-of-order progress");
                            continue;
                        }
                        last_progress = progress.progress;
                        on_progress(&progress);
                        // The callback itself may have cancelled the job
                        if watch.is_cancelled() {
                            return Err(ConvertError::Cancelled);
                        }
                    }
                    WorkerMessage::Success(result) => return Ok(result),
                    WorkerMessage::Error(failure) => {
                        return Err(ConvertError::from_failure(failure, options.format))
                    }
                    WorkerMessage::Convert(_) => {}
                }
            }
            Err(ConvertError::WorkerUnavailable(
                "worker stopped before the job finished".to_string(),
            ))
        };

        let timed = async move {
            match self.inner.job_timeout {
                Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or_else(|_| {
                    warn!(job_id = %id, timeout_ms = limit.as_millis() as u64, "Conversion timed out");
                    Err(ConvertError::Timeout)
                }),
                None => wait.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(job_id = %id, "Conversion cancelled by caller");
                Err(ConvertError::Cancelled)
            }
            outcome = timed => outcome,
        }
    }

    /// Encoded size `input` would have with `options`
    ///
    /// Runs a full conversion and throws the output away, so it costs as much
    /// as [`Coordinator::convert`]. Repeated identical requests are served
    /// from a small memo.
    pub async fn estimate_size(
        &self,
        input: Bytes,
        options: ConvertOptions,
    ) -> Result<u64, ConvertError> {
        let key = EstimateKey::new(input.clone(), options);
        let cached = self.estimates().get(&key);
        if let Some(size) = cached {
            debug!(size, "Estimate served from memo");
            return Ok(size);
        }

        let result = self.convert(input, options, |_| {}).await?;
        self.estimates().insert(key, result.size);
        Ok(result.size)
    }

    fn estimates(&self) -> MutexGuard<'_, EstimateCache> {
        self.inner
            .estimates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::OutputFormat;
    use crate::protocol::{ConversionFailure, FailureStage};

    fn progress(id: JobId, value: u8) -> WorkerMessage {
        WorkerMessage::Progress(ConversionProgress {
            id,
            progress: value,
            stage: "test".to_string(),
            memory_usage: None,
            processing_speed: None,
        })
    }

    fn failure(id: JobId) -> WorkerMessage {
        WorkerMessage::Error(ConversionFailure {
            id,
            error: "nope".to_string(),
            stage: Some(FailureStage::Encode),
        })
    }

    #[test]
    fn test_unknown_id_is_discarded() {
        let table = JobTable::default();
        let _rx = table.register(JobId::new());
        assert!(!table.route(progress(JobId::new(), 10)));
    }

    #[test]
    fn test_terminal_retires_id() {
        let table = JobTable::default();
        let id = JobId::new();
        let mut rx = table.register(id);

        assert!(table.route(progress(id, 10)));
        assert!(table.route(failure(id)));
        assert!(table.is_empty());

        // Anything after the terminal message is dropped
        assert!(!table.route(progress(id, 20)));
        assert!(!table.route(failure(id)));

        assert!(matches!(rx.try_recv(), Ok(WorkerMessage::Progress(_))));
        assert!(matches!(rx.try_recv(), Ok(WorkerMessage::Error(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_routes_only_to_matching_job() {
        let table = JobTable::default();
        let (a, b) = (JobId::new(), JobId::new());
        let mut rx_a = table.register(a);
        let mut rx_b = table.register(b);

        table.route(progress(b, 40));
        table.route(progress(a, 15));

        assert_eq!(rx_a.try_recv().unwrap().id(), a);
        assert_eq!(rx_b.try_recv().unwrap().id(), b);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_estimate_cache_evicts_oldest() {
        let mut cache = EstimateCache::new(2);
        let options = ConvertOptions::new(OutputFormat::Webp, 80);
        let keys: Vec<_> = (0u8..3)
            .map(|i| EstimateKey::new(Bytes::from(vec![i; 4]), options))
            .collect();

        cache.insert(keys[0].clone(), 1);
        cache.insert(keys[1].clone(), 2);
        cache.insert(keys[2].clone(), 3);

        assert_eq!(cache.get(&keys[0]), None);
        assert_eq!(cache.get(&keys[1]), Some(2));
        assert_eq!(cache.get(&keys[2]), Some(3));
    }

    #[test]
    fn test_estimate_key_includes_options() {
        let input = Bytes::from_static(&[1, 2, 3]);
        let low = EstimateKey::new(input.clone(), ConvertOptions::new(OutputFormat::Jpeg, 10));
        let high = EstimateKey::new(input, ConvertOptions::new(OutputFormat::Jpeg, 90));
        assert_ne!(low, high);
    }

    #[test]
    fn test_estimate_key_compares_bytes() {
        let options = ConvertOptions::new(OutputFormat::Png, 0);
        let mut cache = EstimateCache::new(4);
        cache.insert(EstimateKey::new(Bytes::from_static(b"abcd"), options), 7);

        // Same length, different content
        let other = EstimateKey::new(Bytes::from_static(b"abce"), options);
        assert_eq!(cache.get(&other), None);
        let same = EstimateKey::new(Bytes::from(b"abcd".to_vec()), options);
        assert_eq!(cache.get(&same), Some(7));
    }

    #[test]
    fn test_estimate_cache_byte_budget() {
        let options = ConvertOptions::new(OutputFormat::Png, 0);
        let mut cache = EstimateCache::with_byte_budget(8, 10);
        let small = EstimateKey::new(Bytes::from(vec![1u8; 6]), options);
        let next = EstimateKey::new(Bytes::from(vec![2u8; 6]), options);
        let huge = EstimateKey::new(Bytes::from(vec![3u8; 11]), options);

        cache.insert(small.clone(), 1);
        cache.insert(next.clone(), 2);
        cache.insert(huge.clone(), 3);

        // 6 + 6 exceeds the budget, so the older entry went; 11 never fit
        assert_eq!(cache.get(&small), None);
        assert_eq!(cache.get(&next), Some(2));
        assert_eq!(cache.get(&huge), None);
        assert_eq!(cache.held_bytes, 6);
    }

    #[tokio::test]
    async fn test_memo_hit_does_not_start_worker() {
        let coordinator = Coordinator::with_engine(EngineConfig::default(), None, 4);
        // Not an image: only a memo hit can answer for it
        let input = Bytes::from_static(b"not an image");
        let options = ConvertOptions::new(OutputFormat::Webp, 70);
        coordinator
            .estimates()
            .insert(EstimateKey::new(input.clone(), options), 1234);

        let size = coordinator.estimate_size(input.clone(), options).await.unwrap();
        assert_eq!(size, 1234);
        assert!(!coordinator.is_started());

        // Different options miss the memo and reach the worker
        let err = coordinator
            .estimate_size(input, ConvertOptions::new(OutputFormat::Webp, 71))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Decode(_)));
        assert!(coordinator.is_started());
    }

    #[test]
    fn test_zero_capacity_cache_stores_nothing() {
        let mut cache = EstimateCache::new(0);
        let key = EstimateKey::new(Bytes::from_static(b"x"), ConvertOptions::new(OutputFormat::Png, 0));
        cache.insert(key.clone(), 5);
        assert_eq!(cache.get(&key), None);
    }
}
