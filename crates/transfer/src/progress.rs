use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use assetlink_protocol::{AssetHeader, ContentKey};
use serde::{Deserialize, Serialize};

use crate::config::TransferConfig;

/// Default progress notification interval.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// State of one asset transfer as seen by an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

/// Point-in-time progress of one asset transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub id: ContentKey,
    pub name: String,
    pub status: TransferStatus,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
}

impl TransferProgress {
    /// Returns progress as a percentage (0-100); 100 for an empty asset.
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Read side of a transfer's progress counter.
///
/// The producer or consumer that owns the transfer is the only writer;
/// clones of the handle can be polled from any thread without locking the
/// transfer itself.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    inner: Arc<ProgressInner>,
}

#[derive(Debug)]
struct ProgressInner {
    id: ContentKey,
    name: String,
    total: u64,
    transferred: AtomicU64,
    failed: AtomicBool,
}

impl ProgressHandle {
    pub(crate) fn new(header: &AssetHeader) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                id: header.id,
                name: header.name.clone(),
                total: header.size,
                transferred: AtomicU64::new(0),
                failed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn set_transferred(&self, bytes: u64) {
        self.inner.transferred.store(bytes, Ordering::Release);
    }

    pub(crate) fn mark_failed(&self) {
        self.inner.failed.store(true, Ordering::Release);
    }

    pub fn id(&self) -> ContentKey {
        self.inner.id
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.inner.transferred.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.total
    }

    pub fn is_complete(&self) -> bool {
        self.transferred_bytes() >= self.inner.total
    }

    pub fn has_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    /// Fraction transferred; `1.0` for an empty asset.
    pub fn percent_complete(&self) -> f64 {
        if self.inner.total == 0 {
            return 1.0;
        }
        self.transferred_bytes() as f64 / self.inner.total as f64
    }

    pub fn snapshot(&self) -> TransferProgress {
        let transferred = self.transferred_bytes();
        let status = if self.has_failed() {
            TransferStatus::Failed
        } else if transferred >= self.inner.total {
            TransferStatus::Completed
        } else if transferred == 0 {
            TransferStatus::Pending
        } else {
            TransferStatus::InProgress
        };
        TransferProgress {
            id: self.inner.id,
            name: self.inner.name.clone(),
            status,
            total_bytes: self.inner.total,
            transferred_bytes: transferred,
        }
    }
}

/// Callback invoked with transfer progress.
pub type ProgressCallback = Box<dyn Fn(TransferProgress) + Send + Sync>;

type Callbacks = Arc<RwLock<Vec<ProgressCallback>>>;
type Handles = Arc<RwLock<HashMap<ContentKey, ProgressHandle>>>;

/// Polls the progress of many transfers and reports it to callbacks.
///
/// While running, every tick reports each unfinished transfer. A transfer
/// that has completed or failed is reported one last time and then dropped
/// from the tracker.
pub struct ProgressTracker {
    callbacks: Callbacks,
    handles: Handles,
    interval: Duration,
    stop: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

fn emit(callbacks: &[ProgressCallback], progress: &TransferProgress) {
    for cb in callbacks {
        cb(progress.clone());
    }
}

fn poll_once(callbacks: &Callbacks, handles: &Handles) {
    let snapshots: Vec<TransferProgress> = handles
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .map(ProgressHandle::snapshot)
        .collect();

    let finished: Vec<ContentKey> = snapshots
        .iter()
        .filter(|p| matches!(p.status, TransferStatus::Completed | TransferStatus::Failed))
        .map(|p| p.id)
        .collect();
    if !finished.is_empty() {
        let mut handles = handles.write().unwrap_or_else(PoisonError::into_inner);
        for id in &finished {
            handles.remove(id);
        }
    }

    let callbacks = callbacks.read().unwrap_or_else(PoisonError::into_inner);
    for progress in &snapshots {
        emit(&callbacks, progress);
    }
}

impl ProgressTracker {
    /// Creates a tracker that reports every `interval` once started
    /// (500 ms when `None`).
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            callbacks: Arc::new(RwLock::new(Vec::new())),
            handles: Arc::new(RwLock::new(HashMap::new())),
            interval: interval.unwrap_or(DEFAULT_INTERVAL),
            stop: Mutex::new(None),
        }
    }

    /// Creates a tracker reporting at the configured interval.
    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(Some(config.progress_interval()))
    }

    pub fn on_progress(&self, callback: ProgressCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Begins tracking a transfer. A handle for the same key replaces the
    /// previous one.
    pub fn track(&self, handle: ProgressHandle) {
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id(), handle);
    }

    pub fn untrack(&self, id: &ContentKey) {
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub fn get(&self, id: &ContentKey) -> Option<ProgressHandle> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn tracked(&self) -> usize {
        self.handles.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Reports one transfer right away, whatever its status.
    pub fn notify_progress(&self, id: &ContentKey) {
        let Some(progress) = self.get(id).map(|h| h.snapshot()) else {
            return;
        };
        let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
        emit(&callbacks, &progress);
    }

    /// Runs a single reporting pass, as the background task does on each
    /// tick.
    pub fn poll(&self) {
        poll_once(&self.callbacks, &self.handles);
    }

    /// Starts periodic reporting on a tokio task. Must be called from within
    /// a runtime. Starting again replaces the previous task.
    pub fn start(&self) {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let callbacks = Arc::clone(&self.callbacks);
        let handles = Arc::clone(&self.handles);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => poll_once(&callbacks, &handles),
                    _ = &mut rx => break,
                }
            }
            tracing::debug!("progress reporting stopped");
        });
    }

    /// Stops periodic reporting. The task exits once the sender is dropped.
    pub fn stop(&self) {
        self.stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

/// Transfer rate over a sliding time window.
///
/// Fed with cumulative byte counts, typically
/// [`ProgressHandle::transferred_bytes`], so samples taken at irregular
/// intervals still give a correct rate.
pub struct SpeedCalculator {
    window: Duration,
    readings: Mutex<VecDeque<(Instant, u64)>>,
}

impl SpeedCalculator {
    /// Creates a calculator averaging over `window` (5 s when `None`).
    pub fn new(window: Option<Duration>) -> Self {
        Self {
            window: window.unwrap_or(Duration::from_secs(5)),
            readings: Mutex::new(VecDeque::new()),
        }
    }

    /// Records the total transferred so far.
    pub fn record(&self, total_bytes: u64) {
        self.record_at(Instant::now(), total_bytes);
    }

    /// Records a reading taken at `at`. Readings must be recorded in time
    /// order; a total lower than the previous one restarts the window.
    pub fn record_at(&self, at: Instant, total_bytes: u64) {
        let mut readings = self.readings.lock().unwrap_or_else(PoisonError::into_inner);
        if readings.back().is_some_and(|&(_, prev)| total_bytes < prev) {
            readings.clear();
        }
        readings.push_back((at, total_bytes));

        // Keep one reading at or before the window start as the baseline.
        while readings.len() > 2 && at.duration_since(readings[1].0) >= self.window {
            readings.pop_front();
        }
    }

    /// Average bytes per second across the window; 0.0 until two readings
    /// some time apart exist.
    pub fn bytes_per_second(&self) -> f64 {
        let readings = self.readings.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some(&(t0, b0)), Some(&(t1, b1))) = (readings.front(), readings.back()) else {
            return 0.0;
        };
        let elapsed = t1.duration_since(t0);
        if elapsed.is_zero() {
            return 0.0;
        }
        (b1 - b0) as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to move `remaining_bytes` at the current rate.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    pub fn reset(&self) {
        self.readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
