//! Model Registry
//!
//! Owns the single diarization pipeline of the process. The pipeline is loaded
//! on the first `acquire()`, from the local model directory when it exists and
//! from the hub cache otherwise, then placed on the probed device. Once loaded
//! it is never replaced. A failed load caches nothing; the next call retries.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::device::{DeviceDescriptor, DeviceProbe, DeviceReport};
use super::pipeline::{DiarizationPipeline, LoadSource, ModelSource, PipelineLoader};
use crate::config::ModelConfig;
use crate::error::{DiarizationError, Result};

/// Where to look for the pipeline
#[derive(Clone)]
pub struct ModelSettings {
    pub local_path: Option<PathBuf>,
    pub required_files: Vec<String>,
    pub model_id: String,
    pub hf_token: Option<String>,
    pub download_timeout: Duration,
}

impl From<&ModelConfig> for ModelSettings {
    fn from(config: &ModelConfig) -> Self {
        Self {
            local_path: config.local_path.clone(),
            required_files: config.required_files.clone(),
            model_id: config.model_id.clone(),
            hf_token: config.hf_token.clone(),
            download_timeout: config.download_timeout(),
        }
    }
}

/// The loaded, device-placed pipeline
pub struct PipelineHandle {
    pipeline: Box<dyn DiarizationPipeline>,
    source: LoadSource,
    location: String,
    device: DeviceDescriptor,
    loaded_at: DateTime<Utc>,
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("source", &self.source)
            .field("location", &self.location)
            .field("device", &self.device.runtime_name())
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}

impl PipelineHandle {
    pub fn pipeline(&self) -> &dyn DiarizationPipeline {
        self.pipeline.as_ref()
    }

    pub fn source(&self) -> LoadSource {
        self.source
    }

    /// Local path or model id the pipeline came from
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

/// Registry of the process-wide pipeline
pub struct ModelRegistry {
    shared: Arc<Shared>,
    // Serialises the load sequence; never held on the fast path.
    load_gate: Arc<Mutex<()>>,
}

/// State the detached load task needs
struct Shared {
    settings: ModelSettings,
    loader: Arc<dyn PipelineLoader>,
    probe: Arc<DeviceProbe>,
    handle: RwLock<Option<Arc<PipelineHandle>>>,
    load_attempts: AtomicU64,
}

impl ModelRegistry {
    pub fn new(settings: ModelSettings, loader: Arc<dyn PipelineLoader>, probe: Arc<DeviceProbe>) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                loader,
                probe,
                handle: RwLock::new(None),
                load_attempts: AtomicU64::new(0),
            }),
            load_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Get the pipeline, loading it on first use.
    ///
    /// The load runs on its own task and holds the gate until it ends, so a
    /// caller that stops waiting does not abort it.
    pub async fn acquire(&self) -> Result<Arc<PipelineHandle>> {
        if let Some(handle) = self.current() {
            return Ok(handle);
        }

        let gate = self.load_gate.clone().lock_owned().await;

        // Double-check after acquiring the gate
        if let Some(handle) = self.current() {
            return Ok(handle);
        }

        let shared = self.shared.clone();
        let load = tokio::spawn(async move {
            let _gate = gate;
            let handle = Arc::new(shared.load().await?);
            *shared.handle.write() = Some(handle.clone());
            Ok::<_, DiarizationError>(handle)
        });

        load.await.map_err(|e| DiarizationError::ModelLoadFailure(format!("load task failed: {}", e)))?
    }

    /// The pipeline if already loaded. Never triggers a load.
    pub fn current(&self) -> Option<Arc<PipelineHandle>> {
        self.shared.handle.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.shared.handle.read().is_some()
    }

    /// Number of times the load sequence has started
    pub fn load_attempts(&self) -> u64 {
        self.shared.load_attempts.load(Ordering::SeqCst)
    }
}

impl Shared {
    async fn load(&self) -> Result<PipelineHandle> {
        let attempt = self.load_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let source = self.resolve_source()?;
        info!(
            "Loading diarization model (attempt {}) from {} {}",
            attempt,
            source.kind().as_str(),
            source.describe()
        );
        let start = Instant::now();

        let mut pipeline = self.loader.load(&source).await.map_err(|e| match e {
            DiarizationError::ArtifactMissing { .. } | DiarizationError::ModelLoadFailure(_) => e,
            other => DiarizationError::ModelLoadFailure(other.to_string()),
        })?;

        let report = self.probe_device().await;
        if report.low_memory {
            warn!(
                "Low accelerator memory on {}: {:.2} GiB free, inference may be slow",
                report.device.name,
                gib(report.device.free_memory)
            );
        }
        pipeline.place(&report.device).await.map_err(|e| {
            DiarizationError::ModelLoadFailure(format!("placing on {}: {}", report.device.runtime_name(), e))
        })?;

        info!(
            "Model loaded from {} in {:?}, placed on {}",
            source.kind().as_str(),
            start.elapsed(),
            report.device.runtime_name()
        );

        Ok(PipelineHandle {
            pipeline,
            source: source.kind(),
            location: source.describe(),
            device: report.device,
            loaded_at: Utc::now(),
        })
    }

    /// Local directory first, hub cache otherwise
    fn resolve_source(&self) -> Result<ModelSource> {
        if let Some(dir) = self.settings.local_path.as_deref().filter(|p| p.exists()) {
            for file in &self.settings.required_files {
                if !dir.join(file).exists() {
                    return Err(DiarizationError::ArtifactMissing {
                        dir: dir.to_path_buf(),
                        file: file.clone(),
                    });
                }
            }
            return Ok(ModelSource::Local {
                dir: dir.to_path_buf(),
                loader_path: loader_path(dir)
                    .map_err(|e| DiarizationError::ModelLoadFailure(format!("resolving {:?}: {}", dir, e)))?,
            });
        }

        if let Some(ref dir) = self.settings.local_path {
            info!("Local model path {:?} not found, falling back to hub cache", dir);
        }
        Ok(ModelSource::Remote {
            model_id: self.settings.model_id.clone(),
            token: self.settings.hf_token.clone(),
            download_timeout: self.settings.download_timeout,
        })
    }

    async fn probe_device(&self) -> DeviceReport {
        let probe = self.probe.clone();
        match tokio::task::spawn_blocking(move || probe.probe()).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Device probe task failed ({}), using CPU", e);
                DeviceReport {
                    device: DeviceDescriptor::cpu(),
                    low_memory: false,
                }
            }
        }
    }
}

/// Absolute form of `dir` with `/` separators, as the pipeline loader expects
pub fn loader_path(dir: &Path) -> Result<String> {
    let absolute = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir()?.join(dir)
    };
    Ok(normalize_separators(&absolute.to_string_lossy()))
}

fn normalize_separators(path: &str) -> String {
    if std::path::MAIN_SEPARATOR == '/' {
        path.to_string()
    } else {
        path.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::pipeline::RawSegment;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    struct FakePipeline {
        placed_on: Option<String>,
    }

    #[async_trait]
    impl DiarizationPipeline for FakePipeline {
        async fn place(&mut self, device: &DeviceDescriptor) -> Result<()> {
            self.placed_on = Some(device.runtime_name());
            Ok(())
        }

        async fn segment(&self, _audio: &Path) -> Result<Vec<RawSegment>> {
            Ok(vec![])
        }
    }

    /// Counts loads, fails the first `failures` of them
    struct CountingLoader {
        loads: AtomicUsize,
        finished: AtomicUsize,
        failures: usize,
        delay: Duration,
        sources: parking_lot::Mutex<Vec<LoadSource>>,
    }

    impl CountingLoader {
        fn new(failures: usize) -> Arc<Self> {
            Self::with_delay(failures, Duration::from_millis(20))
        }

        fn with_delay(failures: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                failures,
                delay,
                sources: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PipelineLoader for CountingLoader {
        async fn load(&self, source: &ModelSource) -> Result<Box<dyn DiarizationPipeline>> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            self.sources.lock().push(source.kind());
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(DiarizationError::ModelLoadFailure("network unreachable".to_string()));
            }
            Ok(Box::new(FakePipeline { placed_on: None }))
        }
    }

    fn settings(local_path: Option<PathBuf>) -> ModelSettings {
        ModelSettings {
            local_path,
            required_files: vec!["config.yaml".to_string(), "pytorch_model.bin".to_string()],
            model_id: "org/diarization".to_string(),
            hf_token: None,
            download_timeout: Duration::from_secs(600),
        }
    }

    fn registry(local_path: Option<PathBuf>, loader: Arc<CountingLoader>) -> ModelRegistry {
        ModelRegistry::new(settings(local_path), loader, Arc::new(DeviceProbe::cpu_only()))
    }

    #[tokio::test]
    async fn test_concurrent_acquire_loads_once() {
        let loader = CountingLoader::new(0);
        let registry = Arc::new(registry(None, loader.clone()));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.acquire().await.unwrap() })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.load_attempts(), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }

    #[tokio::test]
    async fn test_abandoned_acquire_still_completes_load() {
        let loader = CountingLoader::with_delay(0, Duration::from_millis(200));
        let registry = registry(None, loader.clone());

        let abandoned = tokio::time::timeout(Duration::from_millis(20), registry.acquire()).await;
        assert!(abandoned.is_err());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(loader.finished.load(Ordering::SeqCst), 1);
        assert!(registry.is_loaded());

        registry.acquire().await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.load_attempts(), 1);
    }

    #[tokio::test]
    async fn test_waiter_behind_abandoned_load_gets_its_result() {
        let loader = CountingLoader::with_delay(0, Duration::from_millis(100));
        let registry = Arc::new(registry(None, loader.clone()));

        let first = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();

        let handle = registry.acquire().await.unwrap();
        assert_eq!(handle.source(), LoadSource::RemoteCache);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let loader = CountingLoader::new(1);
        let registry = registry(None, loader.clone());

        let err = registry.acquire().await.unwrap_err();
        assert!(matches!(err, DiarizationError::ModelLoadFailure(_)));
        assert!(!registry.is_loaded());

        let handle = registry.acquire().await.unwrap();
        assert_eq!(handle.source(), LoadSource::RemoteCache);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_local_path_preferred() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "pipeline: {}").unwrap();
        std::fs::write(dir.path().join("pytorch_model.bin"), [0u8; 4]).unwrap();

        let loader = CountingLoader::new(0);
        let registry = registry(Some(dir.path().to_path_buf()), loader.clone());
        let handle = registry.acquire().await.unwrap();

        assert_eq!(handle.source(), LoadSource::Local);
        assert!(!handle.location().contains('\\'));
        assert_eq!(handle.device().runtime_name(), "cpu");
    }

    #[tokio::test]
    async fn test_missing_artifact_is_named() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "pipeline: {}").unwrap();

        let loader = CountingLoader::new(0);
        let registry = registry(Some(dir.path().to_path_buf()), loader.clone());

        match registry.acquire().await {
            Err(DiarizationError::ArtifactMissing { file, .. }) => assert_eq!(file, "pytorch_model.bin"),
            other => panic!("expected ArtifactMissing, got {:?}", other.err()),
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_local_dir_falls_back_to_remote() {
        let loader = CountingLoader::new(0);
        let registry = registry(Some(PathBuf::from("/nonexistent/model/dir")), loader.clone());
        registry.acquire().await.unwrap();

        assert_eq!(*loader.sources.lock(), vec![LoadSource::RemoteCache]);
    }

    #[tokio::test]
    async fn test_current_does_not_load() {
        let loader = CountingLoader::new(0);
        let registry = registry(None, loader.clone());

        assert!(registry.current().is_none());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_loader_path_is_absolute() {
        let path = loader_path(Path::new("models/pipeline")).unwrap();
        assert!(path.ends_with("models/pipeline"));
        assert!(Path::new(&path).is_absolute());
    }
}
