//! Error taxonomy for the acquisition pipeline.
//!
//! Segment-level failures never surface through this type directly: the
//! coordinator absorbs them into a failure set. Everything that aborts a
//! stage (playlist, reassembly, fallback, filesystem) does.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("playlist parse error: {0}")]
    Parse(String),

    #[error("{program} failed ({}): {stderr}", exit_label(*.code))]
    ProcessExecution {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {}s", timeout.as_secs())]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("{} of {total} segments failed after retries", failed.len())]
    SegmentsFailed { failed: Vec<u64>, total: usize },

    #[error("media engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

fn exit_label(code: Option<i32>) -> String {
    code.map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}"))
}

impl Error {
    pub(crate) fn network(url: &str, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.to_string(),
            source,
        }
    }

    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` for failures a segment retry can plausibly recover from.
    ///
    /// Write errors count as transient at segment scope: the attempt is
    /// restarted from scratch into a fresh partial file.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::HttpStatus { .. }
                | Self::Timeout { .. }
                | Self::Filesystem { .. }
        )
    }

    /// Returns `true` if this error is the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_error_message_carries_stderr() {
        let err = Error::ProcessExecution {
            program: "ffmpeg".to_string(),
            code: Some(1),
            stderr: "concat.txt: Invalid data found".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code 1"));
        assert!(msg.contains("Invalid data found"));
    }

    #[test]
    fn test_signal_exit_label() {
        let err = Error::ProcessExecution {
            program: "ffmpeg".to_string(),
            code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("killed by signal"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::HttpStatus {
            url: "https://cdn.example.com/seg-1.ts".to_string(),
            status: 503
        }
        .is_retryable());
        assert!(!Error::Parse("no segments".to_string()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(Error::Cancelled.is_cancelled());
    }

    #[test]
    fn test_segments_failed_message() {
        let err = Error::SegmentsFailed {
            failed: vec![2, 4],
            total: 5,
        };
        assert_eq!(err.to_string(), "2 of 5 segments failed after retries");
    }
}
