//! Configuration loaded from `~/.config/hlsgrab/config.toml`.
//!
//! Every field is optional in the file; missing values fall back to the
//! defaults below. CLI flags are applied on top by the binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Upper bound on any single retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for finished artifacts and per-job temp state.
    pub download_dir: PathBuf,
    /// Optional subdirectory under `download_dir`.
    pub subfolder: Option<String>,
    /// Output container extension, without the dot.
    pub extension: String,
    /// Run an explicit transcode after concatenation.
    pub reencode: bool,
    /// Embed the source thumbnail as an attached picture when one is known.
    pub embed_thumbnail: bool,
    /// Reassemble surviving segments even when some failed.
    pub allow_gaps: bool,
    /// Path to the ffmpeg binary. Discovered in `PATH` when unset.
    pub ffmpeg_path: Option<PathBuf>,
    /// Extra headers sent with every request (e.g. `Referer`).
    pub headers: HashMap<String, String>,
    pub retry: RetryPolicy,
    pub concurrency: ConcurrencyLimits,
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            subfolder: None,
            extension: "mp4".to_string(),
            reencode: false,
            embed_thumbnail: true,
            allow_gaps: false,
            ffmpeg_path: None,
            headers: HashMap::new(),
            retry: RetryPolicy::default(),
            concurrency: ConcurrencyLimits::default(),
            timeouts: Timeouts::default(),
        }
    }
}

/// Per-segment retry schedule.
///
/// Attempt `n` (1-based) that fails waits `backoff_base * n + U(0, jitter)`
/// before attempt `n + 1`. No wait follows the final attempt.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per segment, including the first.
    pub limit: u32,
    pub backoff_base_secs: f64,
    pub jitter_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 5,
            backoff_base_secs: 2.0,
            jitter_secs: 1.0,
        }
    }
}

impl RetryPolicy {
    /// A policy with no waiting between attempts.
    #[must_use]
    pub fn immediate(limit: u32) -> Self {
        Self {
            limit,
            backoff_base_secs: 0.0,
            jitter_secs: 0.0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let jitter = if self.jitter_secs.is_finite() && self.jitter_secs > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter_secs)
        } else {
            0.0
        };
        let secs = self.backoff_base_secs.max(0.0) * f64::from(attempt) + jitter;
        Duration::try_from_secs_f64(secs).map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
    }
}

/// The two concurrency tiers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrencyLimits {
    /// Whole-video downloads in progress at once (outer tier).
    pub jobs: usize,
    /// Segment fetches in flight per job (inner tier).
    pub segments: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            jobs: 2,
            segments: 4,
        }
    }
}

/// Bounded waits for network and subprocess operations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub connect_secs: u64,
    /// Whole-request bound for a playlist GET.
    pub request_secs: u64,
    /// Longest silence allowed while reading any response body. Segment
    /// and whole-file downloads have no overall bound beyond this.
    pub read_secs: u64,
    /// Bound for a single media engine invocation.
    pub engine_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            request_secs: 60,
            read_secs: 30,
            engine_secs: 4 * 60 * 60,
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn engine(&self) -> Duration {
        Duration::from_secs(self.engine_secs)
    }
}

impl Config {
    /// Load from the default location.
    ///
    /// Returns defaults if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Load from an explicit path, falling back to defaults if it is absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| format!("invalid TOML in {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retry.limit == 0 {
            anyhow::bail!("retry.limit must be at least 1");
        }
        for (name, secs) in [
            ("retry.backoff_base_secs", self.retry.backoff_base_secs),
            ("retry.jitter_secs", self.retry.jitter_secs),
        ] {
            if !secs.is_finite() || secs < 0.0 || secs > MAX_BACKOFF.as_secs_f64() {
                anyhow::bail!(
                    "{name} must be between 0 and {} seconds",
                    MAX_BACKOFF.as_secs()
                );
            }
        }
        if self.concurrency.jobs == 0 || self.concurrency.segments == 0 {
            anyhow::bail!("concurrency limits must be at least 1");
        }
        if self.extension.trim_start_matches('.').is_empty() {
            anyhow::bail!("extension must not be empty");
        }
        Ok(())
    }

    /// Directory that receives artifacts and temp state for every job.
    pub fn output_dir(&self) -> PathBuf {
        match self.subfolder.as_deref().map(str::trim) {
            Some(sub) if !sub.is_empty() => self.download_dir.join(sub),
            _ => self.download_dir.clone(),
        }
    }

    /// Extension without a leading dot.
    pub fn extension(&self) -> &str {
        self.extension.trim_start_matches('.')
    }
}

/// Return the path to the config file.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hlsgrab")
        .join("config.toml")
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Videos")
}
