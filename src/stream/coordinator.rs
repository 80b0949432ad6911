//! Fan-out/fan-in of one job's segment fetches.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::job::DownloadJob;
use super::progress::{AcquisitionCounter, ProgressCallback};
use super::segment::{SegmentFetcher, SegmentOutcome};
use crate::error::{Error, Result};
use crate::limiter::Limiter;

/// A segment that is complete on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSegment {
    pub sequence: u64,
    pub path: PathBuf,
    pub bytes: u64,
}

/// What happened to every segment of a job.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionReport {
    /// Sorted by sequence index, whatever order the fetches finished in.
    pub fetched: Vec<FetchedSegment>,
    /// Segments that exhausted their retries.
    pub failed: BTreeSet<u64>,
    pub total: usize,
    pub bytes: u64,
    /// Highest number of segment fetches that were ever in flight at once.
    pub peak_in_flight: usize,
    pub cancelled: bool,
}

impl AcquisitionReport {
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failed.is_empty() && self.fetched.len() == self.total
    }

    /// Decide whether the job may proceed to reassembly.
    ///
    /// Any failed segment fails the job unless `allow_gaps` is set, and
    /// even then at least one segment must have survived.
    pub fn verdict(&self, allow_gaps: bool) -> Result<()> {
        if self.cancelled {
            return Err(Error::Cancelled);
        }
        if !self.failed.is_empty() && (!allow_gaps || self.fetched.is_empty()) {
            return Err(Error::SegmentsFailed {
                failed: self.failed.iter().copied().collect(),
                total: self.total,
            });
        }
        Ok(())
    }
}

/// Runs every segment of a [`DownloadJob`] under the job's inner limiter.
#[derive(Clone)]
pub struct AcquisitionCoordinator {
    fetcher: SegmentFetcher,
    progress: Option<ProgressCallback>,
}

impl AcquisitionCoordinator {
    pub fn new(fetcher: SegmentFetcher) -> Self {
        Self {
            fetcher,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Fetch all segments into the job's temp directory.
    ///
    /// Waits for every spawned fetch before returning, so the failure set
    /// is complete. On cancellation no further fetches are spawned and the
    /// report comes back with `cancelled` set.
    #[instrument(skip_all, fields(title = %job.title, segments = job.segments.len()))]
    pub async fn acquire(
        &self,
        job: &DownloadJob,
        cancel: &CancellationToken,
    ) -> Result<AcquisitionReport> {
        let temp_dir = job.layout.temp_dir.clone();
        tokio::fs::create_dir_all(&temp_dir)
            .await
            .map_err(|e| Error::fs(&temp_dir, e))?;

        let total = job.segments.len();
        let limiter = Limiter::new("segments", job.limits.segments);
        let counter = AcquisitionCounter::new(total, self.progress.clone());
        let mut handles = Vec::with_capacity(total);

        for segment in &job.segments {
            // Permit first, then spawn: a cancel stops new work right here
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                permit = limiter.acquire() => permit?,
            };

            let fetcher = self.fetcher.clone();
            let segment = segment.clone();
            let dir = temp_dir.clone();
            let counter = counter.clone();
            let cancel = cancel.clone();
            let sequence = segment.sequence;

            let handle = tokio::spawn(async move {
                fetcher
                    .fetch(&segment, &dir, permit, Some(&counter), &cancel)
                    .await
            });
            handles.push((sequence, handle));
        }

        let spawned = handles.len();
        if spawned < total {
            debug!(spawned, total, "Stopped spawning segment fetches");
        }

        let outcomes = futures::future::join_all(
            handles
                .into_iter()
                .map(|(sequence, handle)| async move { (sequence, handle.await) }),
        )
        .await;

        let mut report = AcquisitionReport {
            total,
            ..AcquisitionReport::default()
        };

        for (sequence, outcome) in outcomes {
            match outcome {
                Ok(SegmentOutcome::Fetched { path, bytes }) => {
                    report.bytes += bytes;
                    report.fetched.push(FetchedSegment {
                        sequence,
                        path,
                        bytes,
                    });
                }
                Ok(SegmentOutcome::Failed { .. }) => {
                    report.failed.insert(sequence);
                }
                Ok(SegmentOutcome::Cancelled) => report.cancelled = true,
                Err(e) => {
                    warn!(segment = sequence, error = %e, "Segment task aborted");
                    report.failed.insert(sequence);
                }
            }
        }

        report.fetched.sort_by_key(|s| s.sequence);
        report.cancelled |= cancel.is_cancelled();
        report.peak_in_flight = limiter.peak();

        if report.failed.is_empty() && !report.cancelled {
            info!(
                segments = total,
                bytes = report.bytes,
                peak = report.peak_in_flight,
                "All segments fetched"
            );
        } else {
            warn!(
                fetched = report.fetched.len(),
                failed = report.failed.len(),
                cancelled = report.cancelled,
                "Acquisition incomplete"
            );
        }

        Ok(report)
    }
}
