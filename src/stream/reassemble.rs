//! Segment reassembly
//!
//! Writes the concat descriptor in sequence order, runs the engine in
//! stream-copy mode, optionally re-encodes, then renames the result to
//! the final artifact name. Nothing is ever written at the final name
//! until the output is known good, and an existing artifact with the
//! same name is kept; the new one gets a numbered name instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::coordinator::FetchedSegment;
use super::engine::MediaEngine;
use super::job::{remove_file_quietly, JobLayout};
use super::progress::ProgressCallback;
use crate::error::{Error, Result};

const MAX_NAME_SUFFIX: u32 = 1000;

/// A finished artifact at its final path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedOutput {
    pub path: PathBuf,
    pub bytes: u64,
    pub reencoded: bool,
}

pub struct Reassembler {
    engine: Arc<dyn MediaEngine>,
    progress: Option<ProgressCallback>,
}

impl Reassembler {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Concatenate `segments` into `layout.final_path`.
    #[instrument(skip_all, fields(segments = segments.len(), output = %layout.final_path.display()))]
    pub async fn reassemble(
        &self,
        segments: &[FetchedSegment],
        layout: &JobLayout,
        reencode: bool,
    ) -> Result<FinishedOutput> {
        if segments.is_empty() {
            return Err(Error::SegmentsFailed {
                failed: Vec::new(),
                total: 0,
            });
        }

        let mut ordered: Vec<&FetchedSegment> = segments.iter().collect();
        ordered.sort_by_key(|s| s.sequence);
        let paths: Vec<&Path> = ordered.iter().map(|s| s.path.as_path()).collect();

        tokio::fs::write(&layout.descriptor_path, render_descriptor(&paths))
            .await
            .map_err(|e| Error::fs(&layout.descriptor_path, e))?;

        if let Err(e) = self
            .engine
            .concatenate(&layout.descriptor_path, &layout.staging_path, self.progress.clone())
            .await
        {
            remove_file_quietly(&layout.staging_path).await;
            return Err(e);
        }

        finalize(
            self.engine.as_ref(),
            layout,
            &layout.staging_path,
            reencode,
            self.progress.clone(),
        )
        .await
    }
}

/// Optionally re-encode `produced`, check it, and move it to the final name.
///
/// A failed re-encode keeps the stream-copy output. On any error the
/// intermediate files are removed and the final name is left untouched.
pub(crate) async fn finalize(
    engine: &dyn MediaEngine,
    layout: &JobLayout,
    produced: &Path,
    reencode: bool,
    progress: Option<ProgressCallback>,
) -> Result<FinishedOutput> {
    let mut source = produced.to_path_buf();
    let mut reencoded = false;

    if reencode {
        match engine.reencode(produced, &layout.reencode_path, progress).await {
            Ok(()) => {
                remove_file_quietly(produced).await;
                source.clone_from(&layout.reencode_path);
                reencoded = true;
            }
            Err(e) => {
                warn!(error = %e, "Re-encode failed, keeping stream copy");
                remove_file_quietly(&layout.reencode_path).await;
            }
        }
    }

    let bytes = match tokio::fs::metadata(&source).await {
        Ok(meta) if meta.len() > 0 => meta.len(),
        Ok(_) => {
            remove_file_quietly(&source).await;
            return Err(Error::ProcessExecution {
                program: engine.name().to_string(),
                code: Some(0),
                stderr: format!("{} is empty", source.display()),
            });
        }
        Err(e) => return Err(Error::fs(&source, e)),
    };

    let target = match claim_output_path(&layout.final_path).await {
        Ok(target) => target,
        Err(e) => {
            remove_file_quietly(&source).await;
            return Err(e);
        }
    };
    if let Err(e) = tokio::fs::rename(&source, &target).await {
        remove_file_quietly(&source).await;
        remove_file_quietly(&target).await;
        return Err(Error::fs(&target, e));
    }

    info!(path = %target.display(), bytes, reencoded, "Artifact ready");
    Ok(FinishedOutput {
        path: target,
        bytes,
        reencoded,
    })
}

/// Reserve `preferred`, or `{stem} (n).{ext}` when it is taken, by
/// creating an empty placeholder the caller then renames over.
///
/// Creation is exclusive, so concurrent jobs with the same title never
/// claim the same name and an existing artifact is never replaced.
async fn claim_output_path(preferred: &Path) -> Result<PathBuf> {
    let stem = preferred
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = preferred
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for n in 1..=MAX_NAME_SUFFIX {
        let candidate = if n == 1 {
            preferred.to_path_buf()
        } else {
            preferred.with_file_name(format!("{stem} ({n}){ext}"))
        };
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => {
                if n > 1 {
                    warn!(
                        taken = %preferred.display(),
                        path = %candidate.display(),
                        "Output name already exists, using a numbered name"
                    );
                }
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(Error::fs(&candidate, e)),
        }
    }

    Err(Error::fs(
        preferred,
        std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free name after {MAX_NAME_SUFFIX} attempts"),
        ),
    ))
}

/// Render a concat-demuxer descriptor: one `file '<path>'` line per input.
///
/// Single quotes are escaped the way the demuxer expects (`'\''`), and
/// backslashes become forward slashes so Windows paths survive.
pub fn render_descriptor(paths: &[&Path]) -> String {
    let mut out = String::new();
    for path in paths {
        let path = path.to_string_lossy().replace('\\', "/").replace('\'', r"'\''");
        out.push_str("file '");
        out.push_str(&path);
        out.push_str("'\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Engine that records calls and writes fixed output.
    #[derive(Default)]
    struct RecordingEngine {
        descriptors: Mutex<Vec<String>>,
        fail_concat: bool,
        fail_reencode: bool,
    }

    #[async_trait]
    impl MediaEngine for RecordingEngine {
        fn name(&self) -> &str {
            "recording"
        }

        async fn check_available(&self) -> Result<()> {
            Ok(())
        }

        async fn concatenate(
            &self,
            descriptor: &Path,
            output: &Path,
            _progress: Option<ProgressCallback>,
        ) -> Result<()> {
            let text = tokio::fs::read_to_string(descriptor).await.unwrap();
            self.descriptors.lock().unwrap().push(text);
            tokio::fs::write(output, b"partial").await.unwrap();
            if self.fail_concat {
                return Err(Error::ProcessExecution {
                    program: "recording".to_string(),
                    code: Some(1),
                    stderr: "Invalid data found when processing input".to_string(),
                });
            }
            Ok(())
        }

        async fn reencode(
            &self,
            _input: &Path,
            output: &Path,
            _progress: Option<ProgressCallback>,
        ) -> Result<()> {
            if self.fail_reencode {
                return Err(Error::ProcessExecution {
                    program: "recording".to_string(),
                    code: Some(1),
                    stderr: "Unknown encoder 'libx264'".to_string(),
                });
            }
            tokio::fs::write(output, b"reencoded").await.unwrap();
            Ok(())
        }

        async fn fetch_and_decode(
            &self,
            _url: &str,
            _output: &Path,
            _reencode: bool,
            _progress: Option<ProgressCallback>,
        ) -> Result<()> {
            unreachable!()
        }

        async fn mux_thumbnail(&self, _video: &Path, _image: &Path, _output: &Path) -> Result<()> {
            unreachable!()
        }
    }

    fn fetched(dir: &Path, seqs: &[u64]) -> Vec<FetchedSegment> {
        seqs.iter()
            .map(|&sequence| FetchedSegment {
                sequence,
                path: dir.join(format!("seg-{sequence}.ts")),
                bytes: 1,
            })
            .collect()
    }

    #[test]
    fn test_render_descriptor_escaping() {
        let rendered = render_descriptor(&[
            Path::new("/dl/temp_x/seg-1.ts"),
            Path::new("/dl/it's here/seg-2.ts"),
            Path::new(r"C:\dl\seg-3.ts"),
        ]);
        assert_eq!(
            rendered,
            "file '/dl/temp_x/seg-1.ts'\nfile '/dl/it'\\''s here/seg-2.ts'\nfile 'C:/dl/seg-3.ts'\n"
        );
    }

    #[tokio::test]
    async fn test_descriptor_sorted_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(dir.path(), "clip", "mp4");
        let engine = Arc::new(RecordingEngine::default());
        let reassembler = Reassembler::new(engine.clone());

        let out = reassembler
            .reassemble(&fetched(&layout.temp_dir, &[3, 1, 0, 2]), &layout, false)
            .await
            .unwrap();

        assert_eq!(out.path, layout.final_path);
        assert_eq!(std::fs::read(&layout.final_path).unwrap(), b"partial");
        assert!(!layout.staging_path.exists());

        let descriptor = engine.descriptors.lock().unwrap()[0].clone();
        let order: Vec<&str> = descriptor
            .lines()
            .map(|l| l.rsplit('/').next().unwrap().trim_end_matches('\''))
            .collect();
        assert_eq!(order, vec!["seg-0.ts", "seg-1.ts", "seg-2.ts", "seg-3.ts"]);
    }

    #[tokio::test]
    async fn test_concat_failure_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(dir.path(), "clip", "mp4");
        let engine = Arc::new(RecordingEngine {
            fail_concat: true,
            ..RecordingEngine::default()
        });

        let err = Reassembler::new(engine)
            .reassemble(&fetched(&layout.temp_dir, &[1, 2]), &layout, false)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ProcessExecution { code: Some(1), .. }));
        assert!(!layout.final_path.exists());
        assert!(!layout.staging_path.exists());
    }

    #[tokio::test]
    async fn test_reencode_replaces_stream_copy() {
        let dir = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(dir.path(), "clip", "mp4");
        let engine = Arc::new(RecordingEngine::default());

        let out = Reassembler::new(engine)
            .reassemble(&fetched(&layout.temp_dir, &[1]), &layout, true)
            .await
            .unwrap();

        assert!(out.reencoded);
        assert_eq!(std::fs::read(&layout.final_path).unwrap(), b"reencoded");
        assert!(!layout.staging_path.exists());
        assert!(!layout.reencode_path.exists());
    }

    #[tokio::test]
    async fn test_failed_reencode_keeps_copy() {
        let dir = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(dir.path(), "clip", "mp4");
        let engine = Arc::new(RecordingEngine {
            fail_reencode: true,
            ..RecordingEngine::default()
        });

        let out = Reassembler::new(engine)
            .reassemble(&fetched(&layout.temp_dir, &[1]), &layout, true)
            .await
            .unwrap();

        assert!(!out.reencoded);
        assert_eq!(std::fs::read(&layout.final_path).unwrap(), b"partial");
    }

    #[tokio::test]
    async fn test_existing_artifact_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let first = JobLayout::new(dir.path(), "clip", "mp4");
        let second = JobLayout::new(dir.path(), "clip", "mp4");
        tokio::fs::write(&first.final_path, b"earlier job").await.unwrap();

        let engine = Arc::new(RecordingEngine::default());
        let out = Reassembler::new(engine)
            .reassemble(&fetched(&second.temp_dir, &[1]), &second, false)
            .await
            .unwrap();

        assert_eq!(out.path, dir.path().join("clip (2).mp4"));
        assert_eq!(std::fs::read(&out.path).unwrap(), b"partial");
        assert_eq!(std::fs::read(&first.final_path).unwrap(), b"earlier job");
    }

    #[tokio::test]
    async fn test_claims_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let preferred = dir.path().join("clip.mp4");

        let (a, b) = tokio::join!(claim_output_path(&preferred), claim_output_path(&preferred));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a, b);
        assert!(a == preferred || b == preferred);
    }
}
