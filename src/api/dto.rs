//! REST API request/response data transfer objects

use serde::Serialize;

use crate::engine::{DeviceDescriptor, DeviceKind};
use crate::service::health::{Diagnostics, HealthReport};
use crate::service::{DiarizationResult, DiarizationSegment};

/// Diarize response
#[derive(Debug, Serialize)]
pub struct DiarizeResponse {
    pub success: bool,
    pub segments: Vec<SegmentDto>,
    pub total_segments: usize,
    pub processing_time_seconds: f64,
    pub total_time_seconds: f64,
    pub device: DeviceDto,
}

#[derive(Debug, Serialize)]
pub struct SegmentDto {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
}

#[derive(Debug, Serialize)]
pub struct DeviceDto {
    pub kind: DeviceKind,
    /// Runtime identifier handed to the runner, e.g. `cuda:0`
    pub runtime: String,
    pub name: String,
    pub total_memory_gb: f64,
    pub free_memory_gb: f64,
}

impl From<&DeviceDescriptor> for DeviceDto {
    fn from(device: &DeviceDescriptor) -> Self {
        Self {
            kind: device.kind,
            runtime: device.runtime_name(),
            name: device.name.clone(),
            total_memory_gb: to_gb(device.total_memory),
            free_memory_gb: to_gb(device.free_memory),
        }
    }
}

impl From<DiarizationSegment> for SegmentDto {
    fn from(s: DiarizationSegment) -> Self {
        Self {
            start: s.start,
            end: s.end,
            speaker: s.speaker,
        }
    }
}

impl From<DiarizationResult> for DiarizeResponse {
    fn from(result: DiarizationResult) -> Self {
        let total_segments = result.total_segments();
        Self {
            success: true,
            device: DeviceDto::from(&result.device),
            segments: result.segments.into_iter().map(SegmentDto::from).collect(),
            total_segments,
            processing_time_seconds: round2(result.processing_time_secs),
            total_time_seconds: round2(result.total_time_secs),
        }
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    pub device: DeviceDto,
    pub low_memory: bool,
}

impl From<HealthReport> for HealthResponse {
    fn from(report: HealthReport) -> Self {
        Self {
            status: report.status.to_string(),
            model: if report.model_loaded { "loaded" } else { "not loaded" }.to_string(),
            device: DeviceDto::from(&report.device),
            low_memory: report.low_memory,
        }
    }
}

/// System diagnostics response
#[derive(Debug, Serialize)]
pub struct SystemResponse {
    #[serde(flatten)]
    pub diagnostics: Diagnostics,
    pub upload: UploadLimitsDto,
}

#[derive(Debug, Serialize)]
pub struct UploadLimitsDto {
    pub max_file_size_mb: f64,
    pub allowed_extensions: Vec<String>,
}

/// Error response for rejected requests
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: &str) -> Self {
        Self {
            success: None,
            error: error.to_string(),
        }
    }

    /// Body for requests that were accepted but failed while processing
    pub fn failure(error: &str) -> Self {
        Self {
            success: Some(false),
            error: error.to_string(),
        }
    }
}

fn to_gb(bytes: u64) -> f64 {
    round2(bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_reports_kind_and_runtime_separately() {
        let gpu = DeviceDescriptor {
            kind: DeviceKind::Accelerator,
            name: "NVIDIA A10".to_string(),
            index: Some(1),
            total_memory: 24 * 1024 * 1024 * 1024,
            free_memory: 3 * 1024 * 1024 * 1024 / 2,
        };
        let json = serde_json::to_value(DeviceDto::from(&gpu)).unwrap();
        assert_eq!(json["kind"], "accelerator");
        assert_eq!(json["runtime"], "cuda:1");
        assert_eq!(json["name"], "NVIDIA A10");
        assert_eq!(json["total_memory_gb"], 24.0);
        assert_eq!(json["free_memory_gb"], 1.5);
        assert!(json.get("type").is_none());
    }
}
