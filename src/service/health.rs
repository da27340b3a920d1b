//! Health and diagnostics reporting
//!
//! Read-only views over the registry and the device probe. Reporting never
//! loads the model.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::engine::{DeviceDescriptor, DeviceProbe, DeviceReport, LoadSource, ModelRegistry};

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub model_loaded: bool,
    pub device: DeviceDescriptor,
    pub low_memory: bool,
}

/// State of the loaded pipeline, if any
#[derive(Debug, Clone, Serialize)]
pub struct ModelState {
    pub loaded: bool,
    pub source: Option<LoadSource>,
    pub location: Option<String>,
    pub device: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub load_attempts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeInfo {
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub os: &'static str,
    pub arch: &'static str,
    pub cpu_count: usize,
    pub probe_backend: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub runtime: RuntimeInfo,
    pub device: DeviceReport,
    pub model: ModelState,
}

/// Reports service health without mutating shared state
pub struct HealthReporter {
    registry: Arc<ModelRegistry>,
    probe: Arc<DeviceProbe>,
    started: Instant,
}

impl HealthReporter {
    pub fn new(registry: Arc<ModelRegistry>, probe: Arc<DeviceProbe>) -> Self {
        Self {
            registry,
            probe,
            started: Instant::now(),
        }
    }

    pub async fn health(&self) -> HealthReport {
        let report = self.probe_device().await;
        HealthReport {
            status: "healthy",
            model_loaded: self.registry.is_loaded(),
            device: report.device,
            low_memory: report.low_memory,
        }
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            runtime: RuntimeInfo {
                version: env!("CARGO_PKG_VERSION"),
                uptime_seconds: self.started.elapsed().as_secs(),
                os: std::env::consts::OS,
                arch: std::env::consts::ARCH,
                cpu_count: num_cpus::get(),
                probe_backend: self.probe.backend_name(),
            },
            device: self.probe_device().await,
            model: self.model_state(),
        }
    }

    pub fn model_state(&self) -> ModelState {
        let handle = self.registry.current();
        ModelState {
            loaded: handle.is_some(),
            source: handle.as_ref().map(|h| h.source()),
            location: handle.as_ref().map(|h| h.location().to_string()),
            device: handle.as_ref().map(|h| h.device().runtime_name()),
            loaded_at: handle.as_ref().map(|h| h.loaded_at()),
            load_attempts: self.registry.load_attempts(),
        }
    }

    async fn probe_device(&self) -> DeviceReport {
        let probe = self.probe.clone();
        tokio::task::spawn_blocking(move || probe.probe())
            .await
            .unwrap_or_else(|e| {
                warn!("Device probe task failed: {}", e);
                DeviceReport {
                    device: DeviceDescriptor::cpu(),
                    low_memory: false,
                }
            })
    }
}
