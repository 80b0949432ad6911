//! Direct-fetch fallback
//!
//! Path of last resort when segmented acquisition is not possible or did
//! not work. Raw media URLs are first tried as a plain whole-file
//! download; otherwise the media engine fetches the original URL itself.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use url::Url;

use super::engine::MediaEngine;
use super::job::{remove_file_quietly, AcquisitionMethod, JobLayout};
use super::progress::{AcquisitionCounter, ProgressCallback};
use super::reassemble::{finalize, FinishedOutput};
use super::segment::SegmentFetcher;
use crate::error::{Error, Result};

/// Why the fallback was entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// The resolver found media bytes, not a playlist, at `url`.
    RawMedia { url: Url },
    /// Segments failed after retries.
    AcquisitionFailed,
    /// The engine could not reassemble the fetched segments.
    ReassemblyFailed,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::RawMedia { .. } => write!(f, "raw media"),
            FallbackReason::AcquisitionFailed => write!(f, "segment acquisition failed"),
            FallbackReason::ReassemblyFailed => write!(f, "reassembly failed"),
        }
    }
}

/// Output of a successful fallback run.
#[derive(Debug, Clone)]
pub struct FallbackOutput {
    pub output: FinishedOutput,
    pub method: AcquisitionMethod,
}

pub struct DirectFetchFallback {
    engine: Arc<dyn MediaEngine>,
    fetcher: SegmentFetcher,
    progress: Option<ProgressCallback>,
}

impl DirectFetchFallback {
    pub fn new(engine: Arc<dyn MediaEngine>, fetcher: SegmentFetcher) -> Self {
        Self {
            engine,
            fetcher,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Produce `layout.final_path` from `source_url` without segments.
    ///
    /// Failure here is terminal for the job.
    #[instrument(skip(self, layout, cancel), fields(reason = %reason))]
    pub async fn run(
        &self,
        source_url: &str,
        layout: &JobLayout,
        reason: FallbackReason,
        reencode: bool,
        cancel: &CancellationToken,
    ) -> Result<FallbackOutput> {
        if let FallbackReason::RawMedia { ref url } = reason {
            match self.whole_file(url, layout, reencode, cancel).await {
                Ok(output) => {
                    return Ok(FallbackOutput {
                        output,
                        method: AcquisitionMethod::WholeFile,
                    })
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!(error = %e, "Whole-file download failed, handing URL to engine"),
            }
        }

        let output = self.engine_fetch(source_url, layout, reencode, cancel).await?;
        Ok(FallbackOutput {
            output,
            method: AcquisitionMethod::EngineFetch,
        })
    }

    async fn whole_file(
        &self,
        url: &Url,
        layout: &JobLayout,
        reencode: bool,
        cancel: &CancellationToken,
    ) -> Result<FinishedOutput> {
        let counter = AcquisitionCounter::new(1, self.progress.clone());
        let bytes = self
            .fetcher
            .download_with_retry(url, &layout.staging_path, Some(&counter), cancel)
            .await?;
        counter.segment_done();
        info!(bytes, "Downloaded media file directly");

        finalize(
            self.engine.as_ref(),
            layout,
            &layout.staging_path,
            reencode,
            self.progress.clone(),
        )
        .await
    }

    async fn engine_fetch(
        &self,
        url: &str,
        layout: &JobLayout,
        reencode: bool,
        cancel: &CancellationToken,
    ) -> Result<FinishedOutput> {
        info!(engine = self.engine.name(), "Fetching through media engine");

        let fetch = self.engine.fetch_and_decode(
            url,
            &layout.staging_path,
            reencode,
            self.progress.clone(),
        );
        let result = tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            r = fetch => r,
        };

        if let Err(e) = result {
            remove_file_quietly(&layout.staging_path).await;
            return Err(e);
        }

        // The engine already applied the re-encode if one was asked for
        let mut output =
            finalize(self.engine.as_ref(), layout, &layout.staging_path, false, None).await?;
        output.reencoded = reencode;
        Ok(output)
    }
}
