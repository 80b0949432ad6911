//! Segmented media acquisition for hlsgrab
//!
//! Resolves HLS playlists, fetches segments concurrently with retry, and
//! reassembles them through a pluggable media engine (ffmpeg by default),
//! falling back to a direct fetch when the segmented path fails.

pub mod coordinator;
pub mod downloader;
pub mod engine;
pub mod fallback;
pub mod ffmpeg;
pub mod finisher;
pub mod job;
pub mod playlist;
pub mod progress;
pub mod reassemble;
pub mod segment;

pub use coordinator::{AcquisitionCoordinator, AcquisitionReport, FetchedSegment};
pub use downloader::Downloader;
pub use engine::{MediaEngine, MediaProgressTracker};
pub use fallback::{DirectFetchFallback, FallbackOutput, FallbackReason};
pub use ffmpeg::FfmpegEngine;
pub use finisher::ArtifactFinisher;
pub use job::{AcquisitionMethod, DownloadJob, DownloadResult, JobLayout, JobOutcome, MediaSource};
pub use playlist::{
    PlaylistKind, PlaylistReference, PlaylistResolver, Resolution, ResolvedPlaylist, VariantStream,
};
pub use progress::{AcquisitionProgress, MediaProgress, MediaStage, Progress, ProgressCallback};
pub use reassemble::{FinishedOutput, Reassembler};
pub use segment::{SegmentDescriptor, SegmentFetcher, SegmentOutcome};
