//! Service layer value types

use axum::body::Bytes;
use serde::Serialize;

use crate::engine::DeviceDescriptor;

/// One attributed speaker turn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiarizationSegment {
    pub start: f64,
    pub end: f64,
    /// Only meaningful within one diarization run
    pub speaker: String,
}

/// Successful diarization of one upload
#[derive(Debug, Clone)]
pub struct DiarizationResult {
    pub segments: Vec<DiarizationSegment>,
    /// Wall-clock time of the pipeline call alone
    pub processing_time_secs: f64,
    /// Wall-clock time of the whole session
    pub total_time_secs: f64,
    pub device: DeviceDescriptor,
}

impl DiarizationResult {
    pub fn total_segments(&self) -> usize {
        self.segments.len()
    }
}

/// An accepted upload, owned by the request that received it
#[derive(Debug, Clone)]
pub struct UploadedAudio {
    pub filename: String,
    /// Lower-cased extension without the dot
    pub extension: String,
    pub data: Bytes,
}

impl UploadedAudio {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}
