//! Inference session
//!
//! Runs one upload through the pipeline. The audio is staged in a scratch file
//! that is removed on every exit path, including pipeline failures.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::engine::{ModelRegistry, RawSegment};
use crate::error::DiarizationError;

use super::types::{DiarizationResult, DiarizationSegment, UploadedAudio};

/// A session that did not produce a result
#[derive(Debug)]
pub struct SessionFailure {
    pub error: DiarizationError,
    pub elapsed_secs: f64,
}

/// Scratch copy of the upload; deleted when dropped
struct ScratchAudio {
    path: PathBuf,
}

impl ScratchAudio {
    async fn stage(dir: &Path, audio: &UploadedAudio) -> std::io::Result<Self> {
        let suffix = format!(".{}", audio.extension);
        let (file, path) = tempfile::Builder::new()
            .prefix("diarize-")
            .suffix(&suffix)
            .tempfile_in(dir)?
            .into_parts();
        // From here the guard owns removal, so a failed write still cleans up.
        let scratch = Self {
            path: path.keep().map_err(|e| e.error)?,
        };

        let mut file = tokio::fs::File::from_std(file);
        file.write_all(&audio.data).await?;
        file.flush().await?;
        Ok(scratch)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchAudio {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed scratch file {:?}", self.path),
            Err(e) => warn!("Failed to remove scratch file {:?}: {}", self.path, e),
        }
    }
}

/// Orchestrates one diarization request.
///
/// Owns everything it touches so it can run on a detached task.
pub struct InferenceSession {
    registry: Arc<ModelRegistry>,
    scratch_dir: PathBuf,
    request_id: Uuid,
}

impl InferenceSession {
    pub fn new(registry: Arc<ModelRegistry>, scratch_dir: PathBuf) -> Self {
        Self {
            registry,
            scratch_dir,
            request_id: Uuid::new_v4(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Diarize `audio`. Errors are captured into a [`SessionFailure`], never propagated as panics.
    pub async fn run(self, audio: UploadedAudio) -> Result<DiarizationResult, SessionFailure> {
        let span = tracing::info_span!(
            "diarize",
            request_id = %self.request_id,
            file = %audio.filename,
            size = audio.size()
        );
        let start = Instant::now();

        async move {
            info!("Processing file: {} ({:.2} KB)", audio.filename, audio.size() as f64 / 1024.0);
            match self.execute(&audio, start).await {
                Ok(result) => {
                    info!(
                        "Diarization completed: {} segments in {:.2}s",
                        result.total_segments(),
                        result.total_time_secs
                    );
                    Ok(result)
                }
                Err(error) => {
                    error!("Diarization failed ({}): {}", error.kind(), error);
                    Err(SessionFailure {
                        error,
                        elapsed_secs: start.elapsed().as_secs_f64(),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Like [`run`](Self::run), but on a detached task: dropping the returned
    /// future leaves the load, the inference and the cleanup running.
    pub async fn run_detached(self, audio: UploadedAudio) -> Result<DiarizationResult, SessionFailure> {
        let start = Instant::now();
        tokio::spawn(self.run(audio)).await.unwrap_or_else(|e| {
            Err(SessionFailure {
                error: DiarizationError::Inference(format!("session task failed: {}", e)),
                elapsed_secs: start.elapsed().as_secs_f64(),
            })
        })
    }

    async fn execute(&self, audio: &UploadedAudio, start: Instant) -> Result<DiarizationResult, DiarizationError> {
        let scratch = ScratchAudio::stage(&self.scratch_dir, audio).await?;
        let handle = self.registry.acquire().await?;

        let infer_start = Instant::now();
        let raw = handle.pipeline().segment(scratch.path()).await?;
        let processing_time_secs = infer_start.elapsed().as_secs_f64();

        drop(scratch);

        Ok(DiarizationResult {
            segments: to_segments(raw),
            processing_time_secs,
            total_time_secs: start.elapsed().as_secs_f64(),
            device: handle.device().clone(),
        })
    }
}

/// Convert pipeline output one-to-one, keeping emission order
fn to_segments(raw: Vec<RawSegment>) -> Vec<DiarizationSegment> {
    let mut previous_start = f64::NEG_INFINITY;
    let mut unsorted = false;

    let segments: Vec<DiarizationSegment> = raw
        .into_iter()
        .map(|s| {
            if s.start < 0.0 || s.end <= s.start {
                warn!("Pipeline emitted malformed segment [{}, {}] for {}", s.start, s.end, s.speaker);
            }
            if s.start < previous_start {
                unsorted = true;
            }
            previous_start = s.start;
            DiarizationSegment {
                start: s.start,
                end: s.end,
                speaker: s.speaker,
            }
        })
        .collect();

    if unsorted {
        debug!("Pipeline segments are not sorted by start time");
    }
    segments
}
