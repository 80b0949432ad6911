//! Thumbnail embedding.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;
use uuid::Uuid;

use super::engine::MediaEngine;
use super::job::remove_file_quietly;
use super::segment::SegmentFetcher;
use crate::error::{Error, Result};

/// Post-processes a finished artifact in place.
pub struct ArtifactFinisher {
    engine: Arc<dyn MediaEngine>,
    fetcher: SegmentFetcher,
}

impl ArtifactFinisher {
    pub fn new(engine: Arc<dyn MediaEngine>, fetcher: SegmentFetcher) -> Self {
        Self { engine, fetcher }
    }

    /// Mux the image at `thumbnail_url` into `video` as an attached picture.
    ///
    /// `video` is replaced only after the engine succeeded; on any error it
    /// is left exactly as it was. The downloaded image and the temporary
    /// container are removed either way.
    #[instrument(skip(self, cancel), fields(video = %video.display()))]
    pub async fn embed_thumbnail(
        &self,
        video: &Path,
        thumbnail_url: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = Url::parse(thumbnail_url)
            .map_err(|e| Error::Parse(format!("invalid thumbnail URL {thumbnail_url}: {e}")))?;
        let (image, muxed) = temp_paths(video, &url);

        let result = self.embed(video, &url, &image, &muxed, cancel).await;

        remove_file_quietly(&image).await;
        remove_file_quietly(&muxed).await;
        result
    }

    async fn embed(
        &self,
        video: &Path,
        url: &Url,
        image: &Path,
        muxed: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let bytes = self
            .fetcher
            .download_with_retry(url, image, None, cancel)
            .await?;
        debug!(bytes, "Thumbnail downloaded");

        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            r = self.engine.mux_thumbnail(video, image, muxed) => r?,
        }

        tokio::fs::rename(muxed, video)
            .await
            .map_err(|e| Error::fs(video, e))?;
        info!("Thumbnail embedded");
        Ok(())
    }
}

/// Sibling temp names for the image and the muxed container.
fn temp_paths(video: &Path, thumbnail: &Url) -> (PathBuf, PathBuf) {
    let id = Uuid::new_v4();
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let video_ext = video
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mp4".to_string());
    let image_ext = thumbnail
        .path()
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| matches!(ext.as_str(), "jpg" | "jpeg" | "png" | "webp"))
        .unwrap_or_else(|| "jpg".to_string());

    (
        video.with_file_name(format!("{id}_thumb_{stem}.{image_ext}")),
        video.with_file_name(format!("{id}_thumb_{stem}.{video_ext}")),
    )
}
