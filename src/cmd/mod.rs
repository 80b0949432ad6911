pub mod batch;
pub mod download;
pub mod info;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use hlsgrab::stream::MediaStage;
use hlsgrab::{Config, Progress, ProgressCallback};

/// Exit status after Ctrl-C, as shells report SIGINT.
pub const EXIT_CANCELLED: u8 = 130;

/// Minimum time between progress redraws.
const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

/// Flags that override config-file values for a run.
#[derive(Args, Debug, Clone, Default)]
pub struct JobOverrides {
    /// Output container extension (mp4, mkv, ...)
    #[arg(short, long)]
    pub ext: Option<String>,

    /// Download directory
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Subdirectory under the download directory
    #[arg(short, long)]
    pub subfolder: Option<String>,

    /// Re-encode to H.264/AAC after concatenation
    #[arg(long)]
    pub reencode: bool,

    /// Segment fetches in flight per video
    #[arg(long)]
    pub segments: Option<usize>,

    /// Videos downloading at once
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Attempts per segment
    #[arg(long)]
    pub retries: Option<u32>,

    /// Reassemble even when some segments failed
    #[arg(long)]
    pub allow_gaps: bool,

    /// Do not embed thumbnails
    #[arg(long)]
    pub no_thumbnail: bool,

    /// ffmpeg binary to use
    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,
}

impl JobOverrides {
    pub fn apply(self, mut config: Config) -> Result<Config> {
        if let Some(ext) = self.ext {
            if ext.trim_start_matches('.').is_empty() {
                bail!("--ext must not be empty");
            }
            config.extension = ext;
        }
        if let Some(dir) = self.dir {
            config.download_dir = dir;
        }
        if self.subfolder.is_some() {
            config.subfolder = self.subfolder;
        }
        if let Some(n) = self.segments {
            if n == 0 {
                bail!("--segments must be at least 1");
            }
            config.concurrency.segments = n;
        }
        if let Some(n) = self.jobs {
            if n == 0 {
                bail!("--jobs must be at least 1");
            }
            config.concurrency.jobs = n;
        }
        if let Some(n) = self.retries {
            if n == 0 {
                bail!("--retries must be at least 1");
            }
            config.retry.limit = n;
        }
        if self.ffmpeg.is_some() {
            config.ffmpeg_path = self.ffmpeg;
        }
        config.reencode |= self.reencode;
        config.allow_gaps |= self.allow_gaps;
        if self.no_thumbnail {
            config.embed_thumbnail = false;
        }
        Ok(config)
    }
}

/// Cancel `token` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⚠️  Interrupted, cleaning up...");
            token.cancel();
        }
    });
}

pub fn cancelled_exit() -> ExitCode {
    ExitCode::from(EXIT_CANCELLED)
}

/// Render progress on stderr, redrawing at most every [`REDRAW_INTERVAL`].
pub fn progress_printer() -> ProgressCallback {
    let last = Arc::new(Mutex::new(Instant::now()));
    Arc::new(move |progress: Progress| {
        let finished = match progress {
            Progress::Acquisition(a) => a.segments_completed == a.segments_total,
            Progress::Media(m) => m.total_secs.is_some_and(|t| m.elapsed_secs >= t),
        };
        if let Ok(mut last) = last.lock() {
            if !finished && last.elapsed() < REDRAW_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        eprint!("\r{}\x1b[K", render_progress(&progress));
    })
}

fn render_progress(progress: &Progress) -> String {
    match progress {
        Progress::Acquisition(a) => format!(
            "📥 {}/{} segments  {:.1} MB",
            a.segments_completed,
            a.segments_total,
            a.bytes_transferred as f64 / 1_000_000.0
        ),
        Progress::Media(m) => {
            let stage = match m.stage {
                MediaStage::Concatenate => "🔗 Joining",
                MediaStage::Reencode => "🎞️  Re-encoding",
                MediaStage::DirectFetch => "📡 Fetching",
            };
            match m.total_secs {
                Some(total) if total > 0.0 => format!(
                    "{stage} {} / {}  ({:.0}%)",
                    format_clock(m.elapsed_secs),
                    format_clock(total),
                    m.elapsed_secs / total * 100.0
                ),
                _ => format!("{stage} {}", format_clock(m.elapsed_secs)),
            }
        }
    }
}

fn format_clock(secs: f64) -> String {
    let secs = secs.max(0.0) as u64;
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hlsgrab::stream::{AcquisitionProgress, MediaProgress};

    #[test]
    fn test_overrides_apply() {
        let overrides = JobOverrides {
            ext: Some("mkv".to_string()),
            segments: Some(8),
            retries: Some(2),
            allow_gaps: true,
            no_thumbnail: true,
            ..JobOverrides::default()
        };
        let config = overrides.apply(Config::default()).unwrap();
        assert_eq!(config.extension(), "mkv");
        assert_eq!(config.concurrency.segments, 8);
        assert_eq!(config.retry.limit, 2);
        assert!(config.allow_gaps);
        assert!(!config.embed_thumbnail);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let overrides = JobOverrides {
            segments: Some(0),
            ..JobOverrides::default()
        };
        assert!(overrides.apply(Config::default()).is_err());
    }

    #[test]
    fn test_render_progress() {
        let line = render_progress(&Progress::Acquisition(AcquisitionProgress {
            segments_completed: 3,
            segments_total: 10,
            bytes_transferred: 2_500_000,
        }));
        assert_eq!(line, "📥 3/10 segments  2.5 MB");

        let line = render_progress(&Progress::Media(MediaProgress {
            stage: MediaStage::Concatenate,
            elapsed_secs: 30.0,
            total_secs: Some(120.0),
        }));
        assert_eq!(line, "🔗 Joining 0:00:30 / 0:02:00  (25%)");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1_500_000), "1.5 MB");
    }
}
