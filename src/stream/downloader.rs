//! End-to-end job pipeline
//!
//! resolve → acquire → reassemble → finish, with the direct-fetch
//! fallback wired in and temp state purged whatever the outcome.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::coordinator::AcquisitionCoordinator;
use super::engine::MediaEngine;
use super::fallback::{DirectFetchFallback, FallbackReason};
use super::ffmpeg::FfmpegEngine;
use super::finisher::ArtifactFinisher;
use super::job::{AcquisitionMethod, DownloadJob, DownloadResult, JobLayout, JobOutcome, MediaSource};
use super::playlist::{PlaylistResolver, Resolution, ResolvedPlaylist};
use super::progress::ProgressCallback;
use super::reassemble::{FinishedOutput, Reassembler};
use super::segment::SegmentFetcher;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fingerprint::random_profile;
use crate::http_client::build_with_profile;
use crate::limiter::Limiter;

/// Runs download jobs. Cheap to share behind an `Arc`.
pub struct Downloader {
    config: Config,
    client: Client,
    engine: Arc<dyn MediaEngine>,
    /// Outer tier: whole-video downloads in progress.
    jobs: Limiter,
    progress: Option<ProgressCallback>,
}

struct Produced {
    output: FinishedOutput,
    method: AcquisitionMethod,
    failed: BTreeSet<u64>,
}

impl Downloader {
    /// Downloader with a fresh browser profile and the ffmpeg engine.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let profile = random_profile();
        let client = build_with_profile(&config, &profile)?;
        let engine =
            FfmpegEngine::from_config(&config).with_default_header("User-Agent", &profile.user_agent);
        Ok(Self::with_parts(config, client, Arc::new(engine)))
    }

    /// Downloader over an explicit client and engine.
    pub fn with_parts(config: Config, client: Client, engine: Arc<dyn MediaEngine>) -> Self {
        let jobs = Limiter::new("jobs", config.concurrency.jobs);
        Self {
            config,
            client,
            engine,
            jobs,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// The outer limiter, for inspecting how many jobs ran at once.
    pub fn job_limiter(&self) -> &Limiter {
        &self.jobs
    }

    /// Resolve a URL without downloading anything.
    pub async fn resolve(&self, url: &str) -> Result<Resolution> {
        PlaylistResolver::new(self.client.clone())
            .with_timeout(self.config.timeouts.request())
            .resolve(url)
            .await
    }

    /// Fail early when the media engine cannot run.
    pub async fn check_engine(&self) -> Result<()> {
        self.engine.check_available().await
    }

    /// Download every source, at most `concurrency.jobs` at a time.
    ///
    /// A failed job never stops the others. Outcomes come back in input
    /// order.
    pub async fn download_batch(
        &self,
        sources: &[MediaSource],
        cancel: &CancellationToken,
    ) -> Vec<JobOutcome> {
        futures::future::join_all(sources.iter().map(|s| self.download(s, cancel))).await
    }

    /// Run one job to a terminal outcome. Never panics on job failure.
    pub async fn download(&self, source: &MediaSource, cancel: &CancellationToken) -> JobOutcome {
        let title = source.title.clone();

        let _job_permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return JobOutcome::Cancelled { title },
            permit = self.jobs.acquire() => match permit {
                Ok(p) => p,
                Err(error) => return JobOutcome::Failed { title, error },
            },
        };

        let start = Instant::now();
        let dir = match self.prepare_dir().await {
            Ok(dir) => dir,
            Err(error) => return JobOutcome::Failed { title, error },
        };
        let layout = JobLayout::new(&dir, &title, self.config.extension());
        info!(title = %title, job_id = %layout.job_id, url = %source.url, "Starting download");

        let result = self.run(source, &layout, cancel).await;
        layout.cleanup().await;

        match result {
            Ok(produced) => {
                let thumbnail_embedded = self.finish(source, &produced.output, cancel).await;
                let bytes_written = tokio::fs::metadata(&produced.output.path)
                    .await
                    .map_or(produced.output.bytes, |m| m.len());
                let elapsed = start.elapsed();
                info!(
                    title = %title,
                    path = %produced.output.path.display(),
                    bytes = bytes_written,
                    elapsed_ms = elapsed.as_millis(),
                    "Download complete"
                );
                JobOutcome::Completed(DownloadResult {
                    title,
                    output_path: produced.output.path,
                    bytes_written,
                    elapsed,
                    failed_segments: produced.failed,
                    method: produced.method,
                    thumbnail_embedded,
                })
            }
            Err(Error::Cancelled) => {
                info!(title = %title, "Download cancelled");
                JobOutcome::Cancelled { title }
            }
            Err(error) => {
                error!(title = %title, error = %error, "Download failed");
                JobOutcome::Failed { title, error }
            }
        }
    }

    async fn prepare_dir(&self) -> Result<PathBuf> {
        let dir = self.config.output_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::fs(&dir, e))?;
        // Descriptor entries must be absolute
        std::path::absolute(&dir).map_err(|e| Error::fs(&dir, e))
    }

    async fn run(
        &self,
        source: &MediaSource,
        layout: &JobLayout,
        cancel: &CancellationToken,
    ) -> Result<Produced> {
        let reencode = source.reencode || self.config.reencode;
        let fetcher = SegmentFetcher::new(self.client.clone(), self.config.retry.clone());
        let fallback = DirectFetchFallback::new(Arc::clone(&self.engine), fetcher.clone())
            .with_progress(self.progress.clone());

        let resolution = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            r = self.resolve(&source.url) => r?,
        };

        let playlist = match resolution {
            Resolution::RawMedia { url, .. } => {
                let out = fallback
                    .run(&source.url, layout, FallbackReason::RawMedia { url }, reencode, cancel)
                    .await?;
                return Ok(Produced {
                    output: out.output,
                    method: out.method,
                    failed: BTreeSet::new(),
                });
            }
            Resolution::Segmented(playlist) => playlist,
        };

        let reason = match self
            .segmented(&source.title, playlist, layout, fetcher, reencode, cancel)
            .await
        {
            Ok(produced) => return Ok(produced),
            Err(e @ Error::SegmentsFailed { .. }) => {
                warn!(error = %e, "Segmented download failed, falling back");
                FallbackReason::AcquisitionFailed
            }
            Err(e @ (Error::ProcessExecution { .. } | Error::Timeout { .. })) => {
                warn!(error = %e, "Reassembly failed, falling back");
                FallbackReason::ReassemblyFailed
            }
            Err(e) => return Err(e),
        };

        let out = fallback
            .run(&source.url, layout, reason, reencode, cancel)
            .await?;
        Ok(Produced {
            output: out.output,
            method: out.method,
            failed: BTreeSet::new(),
        })
    }

    async fn segmented(
        &self,
        title: &str,
        playlist: ResolvedPlaylist,
        layout: &JobLayout,
        fetcher: SegmentFetcher,
        reencode: bool,
        cancel: &CancellationToken,
    ) -> Result<Produced> {
        let job = DownloadJob {
            title: title.to_string(),
            layout: layout.clone(),
            segments: playlist.segments,
            retry: self.config.retry.clone(),
            limits: self.config.concurrency.clone(),
        };

        let report = AcquisitionCoordinator::new(fetcher)
            .with_progress(self.progress.clone())
            .acquire(&job, cancel)
            .await?;
        report.verdict(self.config.allow_gaps)?;
        if !report.failed.is_empty() {
            warn!(
                missing = ?report.failed,
                "Reassembling with gaps; output will be incomplete"
            );
        }

        let reassembler =
            Reassembler::new(Arc::clone(&self.engine)).with_progress(self.progress.clone());
        let output = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            r = reassembler.reassemble(&report.fetched, layout, reencode) => r?,
        };

        Ok(Produced {
            output,
            method: AcquisitionMethod::Segmented,
            failed: report.failed,
        })
    }

    /// Embed the thumbnail if one is known. Failures are logged, not fatal.
    async fn finish(
        &self,
        source: &MediaSource,
        output: &FinishedOutput,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(ref url) = source.thumbnail_url else {
            return false;
        };
        if !self.config.embed_thumbnail {
            return false;
        }

        let fetcher = SegmentFetcher::new(self.client.clone(), self.config.retry.clone());
        match ArtifactFinisher::new(Arc::clone(&self.engine), fetcher)
            .embed_thumbnail(&output.path, url, cancel)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Thumbnail not embedded");
                false
            }
        }
    }
}
