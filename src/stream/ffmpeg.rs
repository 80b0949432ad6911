//! ffmpeg-backed media engine
//!
//! Uses an ffmpeg subprocess for:
//! - Concatenating downloaded segments (concat demuxer, stream copy)
//! - Re-encoding to H.264/AAC for compatibility
//! - Fetching media URLs the segment path could not handle
//! - Embedding a thumbnail as an attached picture

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::engine::{MediaEngine, MediaProgressTracker};
use super::progress::{MediaStage, ProgressCallback};
use crate::config::Config;
use crate::error::{Error, Result};

/// Diagnostic lines kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Containers that benefit from the index being moved to the front.
const FASTSTART_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v"];

/// ffmpeg-based media engine
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    /// Path to ffmpeg binary
    ffmpeg_path: PathBuf,
    /// Headers sent when ffmpeg fetches a URL itself
    headers: Vec<(String, String)>,
    /// Upper bound for a single invocation
    timeout: Duration,
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegEngine {
    /// Create new engine, searching for the binary in PATH
    pub fn new() -> Self {
        let ffmpeg_path = which::which("ffmpeg").unwrap_or_else(|_| PathBuf::from("ffmpeg"));

        Self {
            ffmpeg_path,
            headers: Vec::new(),
            timeout: Config::default().timeouts.engine(),
        }
    }

    /// Engine honoring the configured binary, headers and timeout.
    pub fn from_config(config: &Config) -> Self {
        let mut engine = Self::new().with_timeout(config.timeouts.engine());
        if let Some(ref path) = config.ffmpeg_path {
            engine = engine.with_ffmpeg_path(path);
        }
        let mut headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();
        engine.with_headers(headers)
    }

    /// Specify custom ffmpeg binary path
    #[must_use]
    pub fn with_ffmpeg_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ffmpeg_path = path.into();
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// Add one header, replacing any existing value for the same name.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Add one header unless a value for the same name is already set.
    #[must_use]
    pub fn with_default_header(self, name: &str, value: &str) -> Self {
        if self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name)) {
            self
        } else {
            self.with_header(name, value)
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg_path
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ARGUMENT BUILDERS
    // ═══════════════════════════════════════════════════════════════════════

    fn base_args() -> Vec<String> {
        ["-hide_banner", "-nostdin", "-y"]
            .iter()
            .map(std::string::ToString::to_string)
            .collect()
    }

    fn concat_args(descriptor: &Path, output: &Path) -> Vec<String> {
        let mut args = Self::base_args();
        args.extend(
            ["-f", "concat", "-safe", "0", "-fflags", "+genpts", "-i"]
                .iter()
                .map(std::string::ToString::to_string),
        );
        args.push(path_arg(descriptor));
        args.extend(["-map", "0", "-c", "copy"].iter().map(std::string::ToString::to_string));
        push_output(&mut args, output);
        args
    }

    fn reencode_args(input: &Path, output: &Path) -> Vec<String> {
        let mut args = Self::base_args();
        args.push("-i".to_string());
        args.push(path_arg(input));
        args.extend(
            [
                "-c:v", "libx264",
                "-vf", "format=yuv420p",
                "-preset", "medium",
                "-c:a", "aac",
                "-b:a", "192k",
            ]
            .iter()
            .map(std::string::ToString::to_string),
        );
        push_output(&mut args, output);
        args
    }

    fn fetch_args(&self, url: &str, output: &Path, reencode: bool) -> Vec<String> {
        let mut args = Self::base_args();

        if !self.headers.is_empty() {
            let header_str: String = self
                .headers
                .iter()
                .map(|(k, v)| format!("{k}: {v}\r\n"))
                .collect();
            args.push("-headers".to_string());
            args.push(header_str);
        }

        // Reconnection for reliability on flaky CDNs
        if url.starts_with("http://") || url.starts_with("https://") {
            args.extend(
                ["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "2"]
                    .iter()
                    .map(std::string::ToString::to_string),
            );
        }

        args.push("-i".to_string());
        args.push(url.to_string());

        if reencode {
            args.extend(
                ["-c:v", "libx264", "-c:a", "aac"]
                    .iter()
                    .map(std::string::ToString::to_string),
            );
        } else {
            args.extend(["-c", "copy"].iter().map(std::string::ToString::to_string));
        }
        push_output(&mut args, output);
        args
    }

    fn thumbnail_args(video: &Path, image: &Path, output: &Path) -> Vec<String> {
        let mut args = Self::base_args();
        args.push("-i".to_string());
        args.push(path_arg(video));
        args.push("-i".to_string());
        args.push(path_arg(image));
        args.extend(
            ["-map", "0", "-map", "1", "-c", "copy", "-disposition:v:1", "attached_pic"]
                .iter()
                .map(std::string::ToString::to_string),
        );
        args.push(path_arg(output));
        args
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PROCESS EXECUTION
    // ═══════════════════════════════════════════════════════════════════════

    /// Run ffmpeg to completion, feeding diagnostics to the progress tracker.
    async fn run(
        &self,
        operation: &str,
        args: Vec<String>,
        stage: Option<MediaStage>,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        debug!("ffmpeg args: {:?}", args);

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stderr = child.stderr.take().ok_or_else(|| Error::ProcessExecution {
            program: "ffmpeg".to_string(),
            code: None,
            stderr: "failed to capture ffmpeg stderr".to_string(),
        })?;

        let mut tracker = stage.map(|s| MediaProgressTracker::new(s, progress));
        let drive = async {
            let tail = read_diagnostics(stderr, |line| {
                if let Some(ref mut t) = tracker {
                    t.observe(line);
                }
                if line.contains("Error") || line.contains("Invalid data") {
                    warn!("ffmpeg: {}", line);
                }
            })
            .await;
            let status = child.wait().await;
            (tail, status)
        };

        let Ok((tail, status)) = tokio::time::timeout(self.timeout, drive).await else {
            let _ = child.start_kill();
            warn!(operation, timeout_secs = self.timeout.as_secs(), "ffmpeg timed out, killed");
            return Err(Error::Timeout {
                operation: format!("ffmpeg {operation}"),
                timeout: self.timeout,
            });
        };

        let tail = tail.map_err(|e| Error::ProcessExecution {
            program: "ffmpeg".to_string(),
            code: None,
            stderr: format!("reading diagnostics: {e}"),
        })?;
        let status = status.map_err(|e| Error::ProcessExecution {
            program: "ffmpeg".to_string(),
            code: None,
            stderr: format!("waiting for exit: {e}"),
        })?;

        if !status.success() {
            return Err(Error::ProcessExecution {
                program: "ffmpeg".to_string(),
                code: status.code(),
                stderr: Vec::from(tail).join("\n"),
            });
        }

        Ok(())
    }

    fn spawn_error(&self, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::EngineUnavailable(format!(
                "ffmpeg not found at {}",
                self.ffmpeg_path.display()
            ))
        } else {
            Error::ProcessExecution {
                program: "ffmpeg".to_string(),
                code: None,
                stderr: format!("failed to start: {e}"),
            }
        }
    }
}

#[async_trait]
impl MediaEngine for FfmpegEngine {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn check_available(&self) -> Result<()> {
        let status = Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::EngineUnavailable(format!(
                "{} -version exited with {status}",
                self.ffmpeg_path.display()
            )))
        }
    }

    #[instrument(skip(self, progress), fields(descriptor = %descriptor.display()))]
    async fn concatenate(
        &self,
        descriptor: &Path,
        output: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let args = Self::concat_args(descriptor, output);
        self.run("concat", args, Some(MediaStage::Concatenate), progress)
            .await?;
        info!(output = %output.display(), "Concatenated segments");
        Ok(())
    }

    #[instrument(skip(self, progress), fields(input = %input.display()))]
    async fn reencode(
        &self,
        input: &Path,
        output: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let args = Self::reencode_args(input, output);
        self.run("reencode", args, Some(MediaStage::Reencode), progress)
            .await?;
        info!(output = %output.display(), "Re-encoded");
        Ok(())
    }

    #[instrument(skip(self, progress))]
    async fn fetch_and_decode(
        &self,
        url: &str,
        output: &Path,
        reencode: bool,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let args = self.fetch_args(url, output, reencode);
        self.run("fetch", args, Some(MediaStage::DirectFetch), progress)
            .await
    }

    async fn mux_thumbnail(&self, video: &Path, image: &Path, output: &Path) -> Result<()> {
        let args = Self::thumbnail_args(video, image, output);
        self.run("thumbnail", args, None, None).await
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn push_output(args: &mut Vec<String>, output: &Path) {
    if wants_faststart(output) {
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
    }
    args.push(path_arg(output));
}

fn wants_faststart(output: &Path) -> bool {
    output
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            FASTSTART_EXTENSIONS
                .iter()
                .any(|f| f.eq_ignore_ascii_case(ext))
        })
}

/// Drain a diagnostic stream, splitting on both `\r` and `\n`.
///
/// ffmpeg rewrites its status line in place with bare carriage returns, so
/// newline-only splitting would hold every progress update until exit.
/// Returns the last few non-empty lines.
pub(crate) async fn read_diagnostics<R, F>(
    mut reader: R,
    mut on_line: F,
) -> std::io::Result<VecDeque<String>>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];

    let mut flush = |pending: &mut Vec<u8>, tail: &mut VecDeque<String>| {
        if pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(pending).trim().to_string();
        pending.clear();
        if line.is_empty() {
            return;
        }
        on_line(&line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    };

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for &b in &buf[..n] {
            if b == b'\r' || b == b'\n' {
                flush(&mut pending, &mut tail);
            } else {
                pending.push(b);
            }
        }
    }
    flush(&mut pending, &mut tail);

    Ok(tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_str(args: &[String]) -> String {
        args.join(" ")
    }

    #[test]
    fn test_concat_args() {
        let args = FfmpegEngine::concat_args(Path::new("/dl/x_seginfo.txt"), Path::new("/dl/x_clip.mp4"));
        let joined = args_str(&args);
        assert!(joined.contains("-f concat -safe 0"));
        assert!(joined.contains("-i /dl/x_seginfo.txt"));
        assert!(joined.contains("-c copy"));
        assert!(joined.contains("-movflags +faststart"));
        assert_eq!(args.last().map(String::as_str), Some("/dl/x_clip.mp4"));
    }

    #[test]
    fn test_faststart_only_for_mp4_family() {
        let mkv = FfmpegEngine::concat_args(Path::new("d.txt"), Path::new("out.mkv"));
        assert!(!mkv.contains(&"-movflags".to_string()));
        let mov = FfmpegEngine::reencode_args(Path::new("in.ts"), Path::new("out.MOV"));
        assert!(mov.contains(&"+faststart".to_string()));
    }

    #[test]
    fn test_reencode_args() {
        let joined = args_str(&FfmpegEngine::reencode_args(Path::new("in.mp4"), Path::new("out.mp4")));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-vf format=yuv420p"));
        assert!(joined.contains("-c:a aac -b:a 192k"));
    }

    #[test]
    fn test_fetch_args_headers_and_copy() {
        let engine = FfmpegEngine::new()
            .with_header("Referer", "https://example.com/")
            .with_header("User-Agent", "Mozilla/5.0");
        let args = engine.fetch_args("https://cdn.example.com/v.m3u8", Path::new("o.mkv"), false);

        let idx = args.iter().position(|a| a == "-headers").unwrap();
        assert_eq!(
            args[idx + 1],
            "Referer: https://example.com/\r\nUser-Agent: Mozilla/5.0\r\n"
        );
        assert!(args.contains(&"-reconnect".to_string()));
        assert!(args_str(&args).contains("-c copy"));

        let reencoded = engine.fetch_args("https://cdn.example.com/v.m3u8", Path::new("o.mkv"), true);
        assert!(args_str(&reencoded).contains("-c:v libx264 -c:a aac"));
    }

    #[test]
    fn test_with_header_replaces() {
        let engine = FfmpegEngine::new()
            .with_header("referer", "a")
            .with_header("Referer", "b");
        assert_eq!(engine.headers, vec![("Referer".to_string(), "b".to_string())]);
    }

    #[test]
    fn test_configured_user_agent_wins() {
        let mut config = Config::default();
        config
            .headers
            .insert("user-agent".to_string(), "custom/1.0".to_string());
        let engine = FfmpegEngine::from_config(&config).with_default_header("User-Agent", "Mozilla/5.0");
        assert_eq!(
            engine.headers,
            vec![("user-agent".to_string(), "custom/1.0".to_string())]
        );

        let engine = FfmpegEngine::from_config(&Config::default())
            .with_default_header("User-Agent", "Mozilla/5.0");
        assert_eq!(
            engine.headers,
            vec![("User-Agent".to_string(), "Mozilla/5.0".to_string())]
        );
    }

    #[test]
    fn test_thumbnail_args() {
        let joined = args_str(&FfmpegEngine::thumbnail_args(
            Path::new("v.mp4"),
            Path::new("t.jpg"),
            Path::new("tmp.mp4"),
        ));
        assert!(joined.contains("-i v.mp4 -i t.jpg -map 0 -map 1 -c copy -disposition:v:1 attached_pic"));
        assert!(joined.ends_with("tmp.mp4"));
    }

    #[tokio::test]
    async fn test_read_diagnostics_splits_carriage_returns() {
        let stderr: &[u8] =
            b"  Duration: 00:00:10.00, start: 0\nframe=1 time=00:00:02.00\rframe=2 time=00:00:05.00\r\n\nconcat.txt: Invalid data found\n";
        let mut seen = Vec::new();
        let tail = read_diagnostics(stderr, |l| seen.push(l.to_string()))
            .await
            .unwrap();

        assert_eq!(seen.len(), 4);
        assert_eq!(seen[1], "frame=1 time=00:00:02.00");
        assert_eq!(tail.back().map(String::as_str), Some("concat.txt: Invalid data found"));
    }

    #[tokio::test]
    async fn test_tail_is_bounded() {
        let text: String = (0..50).map(|i| format!("line {i}\n")).collect();
        let tail = read_diagnostics(text.as_bytes(), |_| {}).await.unwrap();
        assert_eq!(tail.len(), STDERR_TAIL_LINES);
        assert_eq!(tail.front().map(String::as_str), Some("line 30"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let engine = FfmpegEngine::new().with_ffmpeg_path("/nonexistent/ffmpeg-binary");
        let err = engine.check_available().await.unwrap_err();
        assert!(matches!(err, Error::EngineUnavailable(_)));

        let err = engine
            .concatenate(Path::new("d.txt"), Path::new("o.mp4"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EngineUnavailable(_)));
    }
}
