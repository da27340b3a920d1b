//! Diarization pipeline seam
//!
//! The diarization algorithm is an external capability. These traits are the
//! only contact points: a loader turns a [`ModelSource`] into a pipeline, and
//! the pipeline turns an audio file into ordered speaker turns.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::device::DeviceDescriptor;
use crate::error::Result;

/// One speaker turn exactly as the pipeline emitted it
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawSegment {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
}

impl RawSegment {
    pub fn new(start: f64, end: f64, speaker: impl Into<String>) -> Self {
        Self {
            start,
            end,
            speaker: speaker.into(),
        }
    }
}

/// Where the pipeline was loaded from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadSource {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "remote-cache")]
    RemoteCache,
}

impl LoadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadSource::Local => "local",
            LoadSource::RemoteCache => "remote-cache",
        }
    }
}

/// Resolved location of the pipeline artifacts
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    Local {
        dir: PathBuf,
        /// `dir` in the separator convention the loader expects
        loader_path: String,
    },
    Remote {
        model_id: String,
        token: Option<String>,
        download_timeout: Duration,
    },
}

impl ModelSource {
    pub fn kind(&self) -> LoadSource {
        match self {
            ModelSource::Local { .. } => LoadSource::Local,
            ModelSource::Remote { .. } => LoadSource::RemoteCache,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ModelSource::Local { loader_path, .. } => loader_path.clone(),
            ModelSource::Remote { model_id, .. } => model_id.clone(),
        }
    }
}

/// A loaded diarization pipeline
#[async_trait]
pub trait DiarizationPipeline: Send + Sync {
    /// Move the pipeline onto `device`. Called once, right after loading.
    async fn place(&mut self, device: &DeviceDescriptor) -> Result<()>;

    /// Diarize the audio file at `audio`, returning turns in emission order.
    async fn segment(&self, audio: &Path) -> Result<Vec<RawSegment>>;
}

/// Builds pipelines from a resolved source
#[async_trait]
pub trait PipelineLoader: Send + Sync {
    async fn load(&self, source: &ModelSource) -> Result<Box<dyn DiarizationPipeline>>;
}
