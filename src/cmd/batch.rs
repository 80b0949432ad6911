use std::path::Path;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use hlsgrab::{Config, Downloader, JobOutcome, MediaSource};

use super::download::report;
use super::{cancel_on_ctrl_c, cancelled_exit, format_bytes, progress_printer};

pub async fn cmd_batch(config: Config, file: &Path, quiet: bool) -> Result<ExitCode> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading batch file {}", file.display()))?;
    let sources = parse_batch(&text).with_context(|| format!("parsing {}", file.display()))?;
    if sources.is_empty() {
        bail!("{} lists no downloads", file.display());
    }

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

    eprintln!(
        "📋 {} downloads, {} at a time",
        sources.len(),
        downloader.config().concurrency.jobs
    );
    let start = Instant::now();
    let outcomes = downloader.download_batch(&sources, &cancel).await;
    if !quiet {
        eprintln!();
    }

    for outcome in &outcomes {
        report(outcome);
    }

    let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    let cancelled = outcomes.iter().filter(|o| o.is_cancelled()).count();
    let failed = outcomes.len() - succeeded - cancelled;
    let bytes: u64 = outcomes
        .iter()
        .filter_map(|o| match o {
            JobOutcome::Completed(r) => Some(r.bytes_written),
            _ => None,
        })
        .sum();

    eprintln!(
        "\n📊 {succeeded} succeeded, {failed} failed, {cancelled} cancelled  ({} in {:.1}s)",
        format_bytes(bytes),
        start.elapsed().as_secs_f64()
    );

    Ok(if cancel.is_cancelled() {
        cancelled_exit()
    } else if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Parse a batch file: a JSON array of records, or one `url` /
/// `url<TAB>title` per line with `#` comments.
pub fn parse_batch(text: &str) -> Result<Vec<MediaSource>> {
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(text).context("invalid JSON batch");
    }

    let mut sources = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (url, title) = match line.split_once('\t') {
            Some((url, title)) => (url.trim(), title.trim()),
            None => (line, ""),
        };
        if url::Url::parse(url).is_err() {
            bail!("line {}: not a URL: {url}", n + 1);
        }
        let title = if title.is_empty() {
            format!("video_{:03}", sources.len() + 1)
        } else {
            title.to_string()
        };
        sources.push(MediaSource::new(title, url));
    }
    Ok(sources)
}
