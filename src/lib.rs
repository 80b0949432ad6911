//! `hlsgrab` - Segmented video downloader
//!
//! # Features
//!
//! - **Playlist resolution**: master/media HLS playlists, best-variant selection, init segments
//! - **Concurrent fetch**: two-tier limits (jobs, segments per job) with retry and jittered backoff
//! - **Ordered reassembly**: ffmpeg concat in sequence order, optional H.264/AAC re-encode
//! - **Fallback**: whole-file or engine-driven fetch when the segmented path fails
//! - **Thumbnails**: embedded as an attached picture
//!
//! # Example
//!
//! ```rust,no_run
//! use hlsgrab::{Config, Downloader, JobOutcome, MediaSource};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let downloader = Downloader::new(Config::load()?)?;
//!     let source = MediaSource::new("Example", "https://example.com/master.m3u8");
//!     match downloader.download(&source, &CancellationToken::new()).await {
//!         JobOutcome::Completed(r) => println!("Saved {}", r.output_path.display()),
//!         other => println!("{} did not complete", other.title()),
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod http_client;
pub mod limiter;
pub mod sanitize;
pub mod stream;

pub use config::{ConcurrencyLimits, Config, RetryPolicy, Timeouts};
pub use error::{Error, Result};
pub use fingerprint::{chrome_profile, firefox_profile, random_profile, safari_profile, BrowserProfile};
pub use http_client::{build_client, build_with_profile};
pub use limiter::{Limiter, LimiterPermit};
pub use sanitize::sanitize_filename;
pub use stream::{
    DownloadResult, Downloader, FfmpegEngine, JobOutcome, MediaEngine, MediaSource, Progress,
    ProgressCallback, Resolution,
};

/// Version of hlsgrab
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
