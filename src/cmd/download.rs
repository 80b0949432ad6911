use std::process::ExitCode;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use hlsgrab::stream::AcquisitionMethod;
use hlsgrab::{Config, Downloader, JobOutcome, MediaSource};

use super::{cancel_on_ctrl_c, cancelled_exit, format_bytes, progress_printer};

pub async fn cmd_download(
    config: Config,
    url: &str,
    title: Option<String>,
    thumbnail: Option<String>,
    quiet: bool,
) -> Result<ExitCode> {
    let title = title.unwrap_or_else(|| title_from_url(url));
    let mut source = MediaSource::new(title, url);
    source.thumbnail_url = thumbnail;

    let mut downloader = Downloader::new(config).context("building downloader")?;
    if !quiet {
        downloader = downloader.with_progress(progress_printer());
    }
    downloader
        .check_engine()
        .await
        .context("ffmpeg is required for reassembly")?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    if !quiet {
        eprintln!("🎬 {}", source.title);
        eprintln!("📡 {url}");
    }

    let outcome = downloader.download(&source, &cancel).await;
    if !quiet {
        eprintln!();
    }

    Ok(report(&outcome))
}

/// Print a one-job summary and map it to an exit status.
pub fn report(outcome: &JobOutcome) -> ExitCode {
    match outcome {
        JobOutcome::Completed(result) => {
            let via = match result.method {
                AcquisitionMethod::Segmented => "segments",
                AcquisitionMethod::WholeFile => "direct download",
                AcquisitionMethod::EngineFetch => "ffmpeg fallback",
            };
            println!("✅ {}", result.output_path.display());
            eprintln!(
                "   {} in {:.1}s via {via}{}",
                format_bytes(result.bytes_written),
                result.elapsed.as_secs_f64(),
                if result.thumbnail_embedded { ", thumbnail embedded" } else { "" }
            );
            if !result.failed_segments.is_empty() {
                eprintln!(
                    "   ⚠️  {} segment(s) missing: {:?}",
                    result.failed_segments.len(),
                    result.failed_segments
                );
            }
            ExitCode::SUCCESS
        }
        JobOutcome::Failed { title, error } => {
            eprintln!("❌ {title}: {error}");
            ExitCode::FAILURE
        }
        JobOutcome::Cancelled { title } => {
            eprintln!("⏹️  {title}: cancelled");
            cancelled_exit()
        }
    }
}

/// Title for an untitled download: the last path component without its
/// extension, skipping generic playlist names.
fn title_from_url(url: &str) -> String {
    let Ok(parsed) = url::Url::parse(url) else {
        return hlsgrab::sanitize::UNTITLED.to_string();
    };
    let generic = ["index", "master", "playlist", "prog_index", "chunklist"];

    parsed
        .path_segments()
        .into_iter()
        .flatten()
        .rev()
        .filter(|s| !s.is_empty())
        .map(|s| s.rsplit_once('.').map_or(s, |(stem, _)| stem))
        .find(|stem| !generic.iter().any(|g| stem.eq_ignore_ascii_case(g)))
        .map_or_else(|| hlsgrab::sanitize::UNTITLED.to_string(), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_from_url() {
        assert_eq!(title_from_url("https://cdn.example.com/shows/episode-12/master.m3u8"), "episode-12");
        assert_eq!(title_from_url("https://cdn.example.com/clip.mp4?sig=x"), "clip");
        assert_eq!(title_from_url("https://cdn.example.com/index.m3u8"), "untitled_video");
        assert_eq!(title_from_url("not a url"), "untitled_video");
    }
}
