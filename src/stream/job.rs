//! Job-level data model.
//!
//! A [`MediaSource`] is what a scraper hands over; a [`DownloadJob`] is
//! the pipeline's own view of it once the playlist has been resolved.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::segment::SegmentDescriptor;
use crate::config::{ConcurrencyLimits, RetryPolicy};
use crate::error::Error;
use crate::sanitize::sanitize_filename;

/// Input record from the scraping layer.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MediaSource {
    pub title: String,
    /// Playlist (master or media) or a direct media URL.
    #[serde(alias = "playlist_url", alias = "media_url")]
    pub url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    /// Scraper-side hint that the source codecs need a transcode.
    #[serde(default)]
    pub reencode: bool,
}

impl MediaSource {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            thumbnail_url: None,
            reencode: false,
        }
    }

    #[must_use]
    pub fn with_thumbnail(mut self, url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(url.into());
        self
    }
}

/// Every path a job touches. Only `final_path` survives the job.
#[derive(Debug, Clone)]
pub struct JobLayout {
    pub job_id: Uuid,
    /// `{dir}/temp_{id}/`, segment files land here.
    pub temp_dir: PathBuf,
    /// `{dir}/{id}_seginfo.txt`, the concatenation descriptor.
    pub descriptor_path: PathBuf,
    /// `{dir}/{id}_{title}.{ext}`, engine output before the final rename.
    pub staging_path: PathBuf,
    /// `{dir}/{id}_reencode_{title}.{ext}`
    pub reencode_path: PathBuf,
    /// `{dir}/{title}.{ext}`
    pub final_path: PathBuf,
}

impl JobLayout {
    /// `dir` should already be absolute; descriptor entries inherit it.
    pub fn new(dir: &Path, title: &str, extension: &str) -> Self {
        let job_id = Uuid::new_v4();
        let stem = sanitize_filename(title);
        let ext = extension.trim_start_matches('.');

        Self {
            job_id,
            temp_dir: dir.join(format!("temp_{job_id}")),
            descriptor_path: dir.join(format!("{job_id}_seginfo.txt")),
            staging_path: dir.join(format!("{job_id}_{stem}.{ext}")),
            reencode_path: dir.join(format!("{job_id}_reencode_{stem}.{ext}")),
            final_path: dir.join(format!("{stem}.{ext}")),
        }
    }

    /// Remove every temporary artifact. Failures are logged, never raised.
    pub async fn cleanup(&self) {
        match tokio::fs::remove_dir_all(&self.temp_dir).await {
            Ok(()) => debug!(path = %self.temp_dir.display(), "Removed temp dir"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.temp_dir.display(), error = %e, "Failed to remove temp dir"),
        }

        for path in [&self.descriptor_path, &self.staging_path, &self.reencode_path] {
            remove_file_quietly(path).await;
        }
    }
}

/// Best-effort delete; a missing file is not worth a log line.
pub(crate) async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed temp file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
    }
}

/// A resolved download: the ordered segments plus the policies that
/// govern fetching them.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub title: String,
    pub layout: JobLayout,
    /// Ordered by `sequence`; the resolver guarantees it and nothing
    /// reorders it afterwards.
    pub segments: Vec<SegmentDescriptor>,
    pub retry: RetryPolicy,
    pub limits: ConcurrencyLimits,
}

impl DownloadJob {
    pub fn output_path(&self) -> &Path {
        &self.layout.final_path
    }
}

/// How the final artifact was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMethod {
    /// Segments fetched and concatenated locally.
    Segmented,
    /// Single-file HTTP download of a raw media URL.
    WholeFile,
    /// The media engine fetched and demuxed the URL itself.
    EngineFetch,
}

/// Produced once per successful job.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub title: String,
    pub output_path: PathBuf,
    pub bytes_written: u64,
    pub elapsed: Duration,
    /// Sequence indices that never downloaded. Non-empty only when gaps
    /// were explicitly allowed.
    pub failed_segments: BTreeSet<u64>,
    pub method: AcquisitionMethod,
    /// Whether a thumbnail ended up embedded.
    pub thumbnail_embedded: bool,
}

/// Terminal state of one job, reported to the caller instead of an error.
#[derive(Debug)]
pub enum JobOutcome {
    Completed(DownloadResult),
    Failed { title: String, error: Error },
    Cancelled { title: String },
}

impl JobOutcome {
    pub fn title(&self) -> &str {
        match self {
            JobOutcome::Completed(r) => &r.title,
            JobOutcome::Failed { title, .. } | JobOutcome::Cancelled { title } => title,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobOutcome::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = JobLayout::new(Path::new("/dl"), "My: Video?", ".mp4");
        let id = layout.job_id;
        assert_eq!(layout.final_path, PathBuf::from("/dl/My_ Video_.mp4"));
        assert_eq!(layout.temp_dir, PathBuf::from(format!("/dl/temp_{id}")));
        assert_eq!(
            layout.descriptor_path,
            PathBuf::from(format!("/dl/{id}_seginfo.txt"))
        );
        assert_eq!(
            layout.staging_path,
            PathBuf::from(format!("/dl/{id}_My_ Video_.mp4"))
        );
    }

    #[test]
    fn test_layouts_are_unique_per_job() {
        let a = JobLayout::new(Path::new("/dl"), "same", "mp4");
        let b = JobLayout::new(Path::new("/dl"), "same", "mp4");
        assert_ne!(a.temp_dir, b.temp_dir);
        assert_eq!(a.final_path, b.final_path);
    }

    #[tokio::test]
    async fn test_cleanup_removes_temp_state() {
        let dir = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(dir.path(), "clip", "mp4");
        tokio::fs::create_dir_all(&layout.temp_dir).await.unwrap();
        tokio::fs::write(layout.temp_dir.join("seg-1.ts"), b"x").await.unwrap();
        tokio::fs::write(&layout.descriptor_path, b"file 'x'").await.unwrap();
        tokio::fs::write(&layout.final_path, b"video").await.unwrap();

        layout.cleanup().await;

        assert!(!layout.temp_dir.exists());
        assert!(!layout.descriptor_path.exists());
        assert!(layout.final_path.exists());
    }

    #[tokio::test]
    async fn test_cleanup_tolerates_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(dir.path(), "never-started", "mp4");
        layout.cleanup().await;
    }

    #[test]
    fn test_media_source_json_aliases() {
        let json = r#"[
            {"title": "a", "url": "https://x/a.m3u8"},
            {"title": "b", "playlist_url": "https://x/b.m3u8", "thumbnail_url": "https://x/b.jpg"}
        ]"#;
        let sources: Vec<MediaSource> = serde_json::from_str(json).unwrap();
        assert_eq!(sources[0], MediaSource::new("a", "https://x/a.m3u8"));
        assert_eq!(
            sources[1],
            MediaSource::new("b", "https://x/b.m3u8").with_thumbnail("https://x/b.jpg")
        );
    }
}
