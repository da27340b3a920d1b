//! Model and inference error taxonomy

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiarizationError {
    #[error("required model artifact `{file}` not found in {}", .dir.display())]
    ArtifactMissing { dir: PathBuf, file: String },

    #[error("failed to load diarization model: {0}")]
    ModelLoadFailure(String),

    #[error("diarization failed: {0}")]
    Inference(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiarizationError {
    /// Short machine-readable kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DiarizationError::ArtifactMissing { .. } => "artifact_missing",
            DiarizationError::ModelLoadFailure(_) => "model_load_failure",
            DiarizationError::Inference(_) => "inference_error",
            DiarizationError::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, DiarizationError>;
