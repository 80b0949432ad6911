//! Segment download with retry
//!
//! Each attempt streams the body into `{name}.part` and only renames it to
//! the final segment name once the body has been fully written, so a
//! segment file that exists under its final name is always complete.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::Client;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::job::remove_file_quietly;
use super::progress::AcquisitionCounter;
use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::limiter::LimiterPermit;

/// Write buffer per segment; bounds memory regardless of segment size.
const CHUNK_SIZE: usize = 256 * 1024;

/// One media segment as listed in a media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Ordering key. 0 for the init segment, then 1.. in playlist order.
    pub sequence: u64,
    pub url: Url,
    /// Name inside the job's temp directory.
    pub file_name: String,
}

impl SegmentDescriptor {
    pub fn new(sequence: u64, url: Url) -> Self {
        let ext = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext))
            .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(char::is_alphanumeric))
            .unwrap_or("ts")
            .to_ascii_lowercase();

        Self {
            sequence,
            file_name: format!("seg-{sequence}.{ext}"),
            url,
        }
    }

    pub fn is_init(&self) -> bool {
        self.sequence == 0
    }
}

/// Result of fetching one segment. Failures are values, not errors:
/// siblings keep running and the coordinator decides the job's fate.
#[derive(Debug)]
pub enum SegmentOutcome {
    Fetched { path: PathBuf, bytes: u64 },
    Failed { attempts: u32, last_error: Error },
    Cancelled,
}

/// Downloads segments with the job's retry policy.
#[derive(Debug, Clone)]
pub struct SegmentFetcher {
    client: Client,
    retry: RetryPolicy,
}

impl SegmentFetcher {
    pub fn new(client: Client, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fetch `segment` into `dest_dir` while holding `permit`.
    ///
    /// The permit is released when this returns, whatever the outcome.
    pub(crate) async fn fetch(
        &self,
        segment: &SegmentDescriptor,
        dest_dir: &Path,
        permit: LimiterPermit,
        counter: Option<&AcquisitionCounter>,
        cancel: &CancellationToken,
    ) -> SegmentOutcome {
        let _permit = permit;
        let dest = dest_dir.join(&segment.file_name);

        match self.download_with_retry(&segment.url, &dest, counter, cancel).await {
            Ok(bytes) => {
                if let Some(c) = counter {
                    c.segment_done();
                }
                SegmentOutcome::Fetched { path: dest, bytes }
            }
            Err(Error::Cancelled) => SegmentOutcome::Cancelled,
            Err(last_error) => {
                warn!(
                    segment = segment.sequence,
                    url = %segment.url,
                    error = %last_error,
                    "Segment failed after all attempts"
                );
                SegmentOutcome::Failed {
                    attempts: self.retry.limit.max(1),
                    last_error,
                }
            }
        }
    }

    /// Download `url` to `dest` with retry, returning the bytes written.
    ///
    /// On failure or cancellation nothing is left at `dest` or at its
    /// partial name.
    pub(crate) async fn download_with_retry(
        &self,
        url: &Url,
        dest: &Path,
        counter: Option<&AcquisitionCounter>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let limit = self.retry.limit.max(1);
        let part = part_path(dest);
        let mut last_error = None;

        for attempt in 1..=limit {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let result = tokio::select! {
                () = cancel.cancelled() => Err(Error::Cancelled),
                r = self.attempt(url, &part, counter) => r,
            };

            match result {
                Ok(bytes) => {
                    tokio::fs::rename(&part, dest)
                        .await
                        .map_err(|e| Error::fs(dest, e))?;
                    if attempt > 1 {
                        info!(url = %url, attempt, "Segment succeeded after retry");
                    }
                    return Ok(bytes);
                }
                Err(Error::Cancelled) => {
                    remove_file_quietly(&part).await;
                    return Err(Error::Cancelled);
                }
                Err(e) => {
                    remove_file_quietly(&part).await;
                    if !e.is_retryable() || attempt == limit {
                        last_error = Some(e);
                        break;
                    }

                    let delay = self.retry.backoff(attempt);
                    warn!(
                        url = %url,
                        attempt,
                        remaining = limit - attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Segment attempt failed, retrying"
                    );
                    last_error = Some(e);

                    tokio::select! {
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Parse(format!("no attempts made for {url}"))))
    }

    /// One GET, streamed to `part` chunk by chunk.
    #[instrument(skip(self, part, counter), fields(url = %url))]
    async fn attempt(
        &self,
        url: &Url,
        part: &Path,
        counter: Option<&AcquisitionCounter>,
    ) -> Result<u64> {
        let resp = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| Error::network(url.as_str(), e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let file = tokio::fs::File::create(part)
            .await
            .map_err(|e| Error::fs(part, e))?;
        let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::network(url.as_str(), e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| Error::fs(part, e))?;
            written += chunk.len() as u64;
            if let Some(c) = counter {
                c.add_bytes(chunk.len() as u64);
            }
        }

        writer.flush().await.map_err(|e| Error::fs(part, e))?;
        debug!(bytes = written, "Segment body written");
        Ok(written)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}
