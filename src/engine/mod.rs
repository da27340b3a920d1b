//! Inference engine module
//!
//! Provides the model lifecycle around an opaque diarization pipeline:
//! - Device probing with CPU fallback
//! - Single, lazily loaded pipeline with local-first, hub-cache fallback
//! - External runner backend

pub mod device;
pub mod hub;
pub mod pipeline;
pub mod registry;
pub mod runner;

pub use device::{DeviceDescriptor, DeviceKind, DeviceProbe, DeviceReport};
pub use pipeline::{DiarizationPipeline, LoadSource, ModelSource, PipelineLoader, RawSegment};
pub use registry::{ModelRegistry, ModelSettings, PipelineHandle};
pub use runner::RunnerLoader;
