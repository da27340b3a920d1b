//! Speaker Diarization Service
//!
//! Authenticated HTTP service that splits uploaded audio into speaker turns.
//! The model is loaded once and shared across requests.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use diarizer::api::{create_rest_router, AppState, BearerGate, UploadGuard};
use diarizer::config::{Config, PLACEHOLDER_TOKEN};
use diarizer::engine::device::{DevicePreference, NvidiaSmi};
use diarizer::engine::hub::HubSettings;
use diarizer::engine::{DeviceProbe, ModelRegistry, ModelSettings, RunnerLoader};
use diarizer::service::HealthReporter;

fn main() -> Result<()> {
    let (config, load_error) = Config::from_env();

    // Proxy variables are process-wide; set them while still single-threaded
    config.proxy.apply();

    init_tracing(&config);

    if let Some(e) = load_error {
        info!("Using default config ({}: {})", Config::default_path(), e);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(serve(config))
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting Speaker Diarization Service v{}", env!("CARGO_PKG_VERSION"));

    if config.auth.token == PLACEHOLDER_TOKEN {
        warn!("DIARIZATION_TOKEN is still the placeholder value; set a real secret before exposing this service");
    }

    info!("Configuration loaded:");
    info!("  Listen: {}:{}", config.server.host, config.server.port);
    info!("  Token: {} chars", config.auth.token.len());
    info!("  Device preference: {}", config.inference.device);
    info!("  Runner: {}", config.inference.runner.join(" "));
    info!("  Runner startup timeout: {}s", config.inference.runner_startup_timeout_secs);
    match config.model.local_path {
        Some(ref path) => info!("  Local model: {:?}", path),
        None => info!("  Local model: <none>"),
    }
    info!("  Hub model: {}", config.model.model_id);
    info!("  Upload limit: {:?} MB", config.upload.max_file_size as f64 / (1024.0 * 1024.0));
    if config.proxy.is_configured() {
        info!("  Proxy: configured (http={}, https={})", config.proxy.http.is_some(), config.proxy.https.is_some());
    }

    let probe = Arc::new(DeviceProbe::new(
        Arc::new(NvidiaSmi::new()),
        DevicePreference::parse(&config.inference.device),
        config.inference.low_memory_threshold,
    ));

    let hub = HubSettings {
        cache_dir: config.model.cache_dir.clone(),
        files: config.model.remote_files.clone(),
    };
    let loader = Arc::new(RunnerLoader::new(
        config.inference.runner.clone(),
        hub,
        config.model.hf_token.clone(),
        config.inference.runner_startup_timeout(),
    ));

    let registry = Arc::new(ModelRegistry::new(
        ModelSettings::from(&config.model),
        loader,
        probe.clone(),
    ));

    if config.model.preload {
        let start = Instant::now();
        match registry.acquire().await {
            Ok(handle) => info!(
                "Model preloaded from {} on {} in {:.2}s",
                handle.location(),
                handle.device().runtime_name(),
                start.elapsed().as_secs_f64()
            ),
            Err(e) => warn!("Model preload failed, will retry on first request: {}", e),
        }
    }

    let scratch_dir = config.scratch_dir();
    tokio::fs::create_dir_all(&scratch_dir)
        .await
        .with_context(|| format!("failed to create scratch dir {:?}", scratch_dir))?;

    let app_state = Arc::new(AppState {
        registry: registry.clone(),
        health: HealthReporter::new(registry, probe),
        guard: UploadGuard::from_config(&config.upload),
        auth: Arc::new(BearerGate::new(config.auth.token.clone())),
        scratch_dir,
    });

    let router = create_rest_router(app_state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("Speaker Diarization Service is ready!");
    info!("REST: http://{}/health", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Goodbye!");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining in-flight requests...");
}
