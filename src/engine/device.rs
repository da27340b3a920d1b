//! Device probe
//!
//! Reports which compute device inference should run on and how much memory
//! it has. Every call measures afresh; nothing is cached between probes.

use std::process::Command;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Accelerator,
}

/// Compute resource used for inference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    pub name: String,
    /// Backend ordinal for accelerators
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    pub total_memory: u64,
    pub free_memory: u64,
}

impl DeviceDescriptor {
    pub fn cpu() -> Self {
        let (total_memory, free_memory) = host_memory();
        Self {
            kind: DeviceKind::Cpu,
            name: "cpu".to_string(),
            index: None,
            total_memory,
            free_memory,
        }
    }

    /// Device argument understood by the runner (`cuda:0`, `cpu`)
    pub fn runtime_name(&self) -> String {
        match (self.kind, self.index) {
            (DeviceKind::Accelerator, Some(index)) => format!("cuda:{}", index),
            (DeviceKind::Accelerator, None) => "cuda".to_string(),
            (DeviceKind::Cpu, _) => "cpu".to_string(),
        }
    }

    pub fn is_accelerator(&self) -> bool {
        self.kind == DeviceKind::Accelerator
    }
}

/// Result of one probe call
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device: DeviceDescriptor,
    /// Accelerator present but below the free-memory threshold
    pub low_memory: bool,
}

/// Raw accelerator reading from a backend
#[derive(Debug, Clone, PartialEq)]
pub struct AcceleratorInfo {
    pub index: u32,
    pub name: String,
    pub total_memory: u64,
    pub free_memory: u64,
}

/// Source of accelerator information
pub trait AcceleratorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn query(&self) -> Option<AcceleratorInfo>;

    /// Best-effort release of cached device memory before measuring.
    fn release_cached_memory(&self) {}
}

/// Reads GPU state through `nvidia-smi`
pub struct NvidiaSmi {
    binary: String,
}

impl NvidiaSmi {
    pub fn new() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
        }
    }
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceleratorBackend for NvidiaSmi {
    fn name(&self) -> &'static str {
        "nvidia-smi"
    }

    fn query(&self) -> Option<AcceleratorInfo> {
        let output = Command::new(&self.binary)
            .args([
                "--query-gpu=index,name,memory.total,memory.free",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .map_err(|e| debug!("nvidia-smi unavailable: {}", e))
            .ok()?;

        if !output.status.success() {
            debug!("nvidia-smi exited with {}", output.status);
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.lines().find_map(parse_smi_line)
    }

    // Device memory belongs to runner processes and is returned when they exit.
    fn release_cached_memory(&self) {}
}

/// Backend for hosts without an accelerator
pub struct NoAccelerator;

impl AcceleratorBackend for NoAccelerator {
    fn name(&self) -> &'static str {
        "none"
    }

    fn query(&self) -> Option<AcceleratorInfo> {
        None
    }
}

/// Parse `0, NVIDIA A10G, 23028, 22515` (memory in MiB)
fn parse_smi_line(line: &str) -> Option<AcceleratorInfo> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 4 {
        return None;
    }
    let mib = |s: &str| s.parse::<u64>().ok().map(|v| v * 1024 * 1024);
    Some(AcceleratorInfo {
        index: fields[0].parse().ok()?,
        name: fields[1].to_string(),
        total_memory: mib(fields[2])?,
        free_memory: mib(fields[3])?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    Auto,
    Cpu,
    Cuda,
}

impl DevicePreference {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "cpu" => DevicePreference::Cpu,
            "cuda" | "gpu" => DevicePreference::Cuda,
            "auto" | "" => DevicePreference::Auto,
            other => {
                warn!("Unknown device preference '{}', using auto", other);
                DevicePreference::Auto
            }
        }
    }
}

/// Inspects the host for an acceleration device
pub struct DeviceProbe {
    backend: Arc<dyn AcceleratorBackend>,
    preference: DevicePreference,
    low_memory_threshold: u64,
}

impl DeviceProbe {
    pub fn new(
        backend: Arc<dyn AcceleratorBackend>,
        preference: DevicePreference,
        low_memory_threshold: u64,
    ) -> Self {
        Self {
            backend,
            preference,
            low_memory_threshold,
        }
    }

    /// Probe that always reports the CPU
    pub fn cpu_only() -> Self {
        Self::new(Arc::new(NoAccelerator), DevicePreference::Cpu, 0)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Measure the current device. Never fails: missing accelerators degrade to CPU.
    pub fn probe(&self) -> DeviceReport {
        if self.preference == DevicePreference::Cpu {
            return DeviceReport {
                device: DeviceDescriptor::cpu(),
                low_memory: false,
            };
        }

        self.backend.release_cached_memory();

        match self.backend.query() {
            Some(info) => {
                let low_memory = info.free_memory < self.low_memory_threshold;
                DeviceReport {
                    device: DeviceDescriptor {
                        kind: DeviceKind::Accelerator,
                        name: info.name,
                        index: Some(info.index),
                        total_memory: info.total_memory,
                        free_memory: info.free_memory,
                    },
                    low_memory,
                }
            }
            None => {
                if self.preference == DevicePreference::Cuda {
                    warn!("CUDA requested but no accelerator found via {}, falling back to CPU", self.backend.name());
                }
                DeviceReport {
                    device: DeviceDescriptor::cpu(),
                    low_memory: false,
                }
            }
        }
    }
}

/// Total and available host memory in bytes
#[cfg(target_os = "linux")]
fn host_memory() -> (u64, u64) {
    let meminfo = match std::fs::read_to_string("/proc/meminfo") {
        Ok(content) => content,
        Err(e) => {
            debug!("Failed to read /proc/meminfo: {}", e);
            return (0, 0);
        }
    };

    let mut total = 0;
    let mut available = 0;
    for line in meminfo.lines() {
        if line.starts_with("MemTotal:") {
            total = parse_meminfo_kib(line);
        } else if line.starts_with("MemAvailable:") {
            available = parse_meminfo_kib(line);
        }
    }
    (total * 1024, available * 1024)
}

#[cfg(not(target_os = "linux"))]
fn host_memory() -> (u64, u64) {
    (0, 0)
}

#[cfg(target_os = "linux")]
fn parse_meminfo_kib(line: &str) -> u64 {
    line.split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
