//! Media engine abstraction
//!
//! The pipeline never shells out directly: reassembly, re-encoding, direct
//! fetches and thumbnail muxing all go through [`MediaEngine`], so tests
//! can swap in a fake and a different tool could replace ffmpeg.

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::progress::{MediaProgress, MediaStage, Progress, ProgressCallback};
use crate::error::Result;

/// External media tool operations.
///
/// Every operation writes to `output` only; inputs are never modified.
/// Implementations must terminate the underlying process when the
/// returned future is dropped.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Probe whether the engine can run at all.
    async fn check_available(&self) -> Result<()>;

    /// Stream-copy the inputs listed in a concat descriptor into `output`.
    async fn concatenate(
        &self,
        descriptor: &Path,
        output: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<()>;

    /// Transcode `input` into a widely compatible H.264/AAC file.
    async fn reencode(
        &self,
        input: &Path,
        output: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<()>;

    /// Let the engine pull `url` itself and write a container to `output`.
    async fn fetch_and_decode(
        &self,
        url: &str,
        output: &Path,
        reencode: bool,
        progress: Option<ProgressCallback>,
    ) -> Result<()>;

    /// Copy all streams of `video` plus `image` as an attached picture.
    async fn mux_thumbnail(&self, video: &Path, image: &Path, output: &Path) -> Result<()>;
}

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").unwrap());

static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").unwrap());

fn hms_seconds(caps: &regex::Captures<'_>) -> Option<f64> {
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse a `Duration: HH:MM:SS.ff` header line into seconds.
pub fn parse_duration(line: &str) -> Option<f64> {
    DURATION_RE.captures(line).and_then(|c| hms_seconds(&c))
}

/// Parse the `time=HH:MM:SS.ff` field of a status line into seconds.
pub fn parse_time(line: &str) -> Option<f64> {
    TIME_RE.captures(line).and_then(|c| hms_seconds(&c))
}

/// Turns engine diagnostic lines into monotonic progress updates.
///
/// The total is taken from the first `Duration:` marker only (later ones
/// belong to outputs or attached streams). Elapsed time never moves
/// backwards and never exceeds a known total.
pub struct MediaProgressTracker {
    stage: MediaStage,
    total: Option<f64>,
    elapsed: f64,
    callback: Option<ProgressCallback>,
}

impl MediaProgressTracker {
    pub fn new(stage: MediaStage, callback: Option<ProgressCallback>) -> Self {
        Self {
            stage,
            total: None,
            elapsed: 0.0,
            callback,
        }
    }

    /// Feed one line; returns the update if it advanced progress.
    pub fn observe(&mut self, line: &str) -> Option<MediaProgress> {
        if self.total.is_none() {
            if let Some(total) = parse_duration(line) {
                self.total = Some(total);
                return None;
            }
        }

        let mut time = parse_time(line)?;
        if let Some(total) = self.total {
            time = time.min(total);
        }
        if time <= self.elapsed {
            return None;
        }
        self.elapsed = time;

        let update = MediaProgress {
            stage: self.stage,
            elapsed_secs: self.elapsed,
            total_secs: self.total,
        };
        if let Some(ref cb) = self.callback {
            cb(Progress::Media(update));
        }
        Some(update)
    }

    pub fn total(&self) -> Option<f64> {
        self.total
    }

    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }
}
