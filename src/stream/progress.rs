//! Progress reporting surface.
//!
//! The pipeline only emits [`Progress`] snapshots through a callback;
//! rendering (bars, colors) belongs to the caller.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Callback invoked with every progress update.
///
/// Shared between concurrently running segment tasks, so it must be
/// cheap and non-blocking.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Snapshot emitted by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Segment download phase.
    Acquisition(AcquisitionProgress),
    /// Engine phase (reassembly, re-encode or direct fetch).
    Media(MediaProgress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionProgress {
    /// Segments fully written to disk.
    pub segments_completed: usize,
    pub segments_total: usize,
    /// Body bytes received across all segments, including failed attempts.
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaProgress {
    /// Which engine operation is running.
    pub stage: MediaStage,
    /// Media seconds processed so far. Never decreases within one run.
    pub elapsed_secs: f64,
    /// Total media seconds, once the engine has reported it.
    pub total_secs: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStage {
    Concatenate,
    Reencode,
    DirectFetch,
}

/// Shared counters for one job's acquisition phase.
///
/// Updated atomically from every segment task.
#[derive(Clone)]
pub(crate) struct AcquisitionCounter {
    completed: Arc<AtomicUsize>,
    bytes: Arc<AtomicU64>,
    total: usize,
    callback: Option<ProgressCallback>,
}

impl AcquisitionCounter {
    pub(crate) fn new(total: usize, callback: Option<ProgressCallback>) -> Self {
        Self {
            completed: Arc::new(AtomicUsize::new(0)),
            bytes: Arc::new(AtomicU64::new(0)),
            total,
            callback,
        }
    }

    pub(crate) fn add_bytes(&self, n: u64) {
        let bytes = self.bytes.fetch_add(n, Ordering::Relaxed) + n;
        self.emit(self.completed.load(Ordering::Relaxed), bytes);
    }

    pub(crate) fn segment_done(&self) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(completed, self.bytes.load(Ordering::Relaxed));
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn emit(&self, segments_completed: usize, bytes_transferred: u64) {
        if let Some(ref cb) = self.callback {
            cb(Progress::Acquisition(AcquisitionProgress {
                segments_completed,
                segments_total: self.total,
                bytes_transferred,
            }));
        }
    }
}
