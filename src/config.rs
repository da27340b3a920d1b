//! Diarization service configuration
//!
//! Values come from `config.toml` first, then the environment variables the
//! service has always honoured override them.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder secret shipped in the defaults; startup warns when it is still in use.
pub const PLACEHOLDER_TOKEN: &str = "your-secret-token-here";

/// Canonical hub identifier of the diarization pipeline.
pub const DEFAULT_MODEL_ID: &str = "pyannote/speaker-diarization-3.1";

/// Remote fetches get a long timeout; slow links and proxies are common.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 600;

/// 100 MiB upload ceiling.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Loading a large pipeline on a cold cache can take minutes.
pub const DEFAULT_RUNNER_STARTUP_TIMEOUT_SECS: u64 = 600;

/// Accelerators with less free memory than this are flagged as low on memory.
pub const DEFAULT_LOW_MEMORY_THRESHOLD: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub model: ModelConfig,
    pub inference: InferenceConfig,
    pub upload: UploadConfig,
    pub proxy: ProxySettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: String,
}

// Keep the secret out of `{:?}` output.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token", &format_args!("<{} chars>", self.token.len()))
            .finish()
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Local pipeline directory, tried before the hub.
    pub local_path: Option<PathBuf>,
    /// Files that must exist inside `local_path`.
    pub required_files: Vec<String>,
    pub model_id: String,
    /// Files fetched from the hub to materialise the pipeline snapshot.
    pub remote_files: Vec<String>,
    pub hf_token: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub download_timeout_secs: u64,
    /// Load the pipeline before accepting connections.
    pub preload: bool,
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("local_path", &self.local_path)
            .field("required_files", &self.required_files)
            .field("model_id", &self.model_id)
            .field("remote_files", &self.remote_files)
            .field("hf_token", &self.hf_token.as_ref().map(|_| "<set>"))
            .field("cache_dir", &self.cache_dir)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("preload", &self.preload)
            .finish()
    }
}

impl ModelConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// `auto`, `cpu` or `cuda`
    pub device: String,
    /// Command line of the external diarization runner.
    pub runner: Vec<String>,
    /// How long the runner may take to load the model and report ready.
    pub runner_startup_timeout_secs: u64,
    pub low_memory_threshold: u64,
    /// Where per-request audio files are staged; the OS temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_file_size: u64,
    pub allowed_extensions: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub http: Option<String>,
    pub https: Option<String>,
    pub no_proxy: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> String {
        std::env::var("DIARIZATION_CONFIG").unwrap_or_else(|_| "config.toml".to_string())
    }

    /// Load the config file (or defaults) and overlay the environment.
    ///
    /// Runs before logging exists, so the file error is handed back for the caller to report.
    pub fn from_env() -> (Self, Option<anyhow::Error>) {
        let (mut config, load_error) = match Self::load(&Self::default_path()) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        };
        config.apply_env(|key| std::env::var(key).ok());
        (config, load_error)
    }

    /// Overlay environment values onto the loaded configuration.
    ///
    /// `lookup` is injected so tests do not have to touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = non_empty("DIARIZATION_TOKEN") {
            self.auth.token = token;
        }
        if let Some(path) = non_empty("PYANNOTE_MODEL_PATH") {
            self.model.local_path = Some(PathBuf::from(path));
        }
        if let Some(host) = non_empty("DIARIZATION_HOST") {
            self.server.host = host;
        }
        if let Some(port) = non_empty("DIARIZATION_PORT").and_then(|p| p.trim().parse().ok()) {
            self.server.port = port;
        }
        if let Some(token) = non_empty("HF_TOKEN") {
            self.model.hf_token = Some(token);
        }
        if let Some(secs) = non_empty("HF_HUB_DOWNLOAD_TIMEOUT").and_then(|s| s.trim().parse().ok()) {
            self.model.download_timeout_secs = secs;
        }
        if let Some(device) = non_empty("DIARIZATION_DEVICE") {
            self.inference.device = device;
        }

        let proxy = |upper: &str, lower: &str| non_empty(upper).or_else(|| non_empty(lower));
        if let Some(http) = proxy("HTTP_PROXY", "http_proxy") {
            self.proxy.http = Some(http);
        }
        if let Some(https) = proxy("HTTPS_PROXY", "https_proxy") {
            self.proxy.https = Some(https);
        }
        if let Some(no_proxy) = proxy("NO_PROXY", "no_proxy") {
            self.proxy.no_proxy = Some(no_proxy);
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.inference
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl InferenceConfig {
    pub fn runner_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.runner_startup_timeout_secs)
    }
}

impl ProxySettings {
    pub fn is_configured(&self) -> bool {
        self.http.is_some() || self.https.is_some()
    }

    /// Export proxy variables in both spellings so every HTTP client sees them.
    ///
    /// Must run before the async runtime starts: it mutates the process environment.
    pub fn apply(&self) {
        if !self.is_configured() {
            return;
        }
        let pairs = [
            (&self.http, "HTTP_PROXY", "http_proxy"),
            (&self.https, "HTTPS_PROXY", "https_proxy"),
            (&self.no_proxy, "NO_PROXY", "no_proxy"),
        ];
        for (value, upper, lower) in pairs {
            if let Some(value) = value {
                std::env::set_var(upper, value);
                std::env::set_var(lower, value);
            }
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: PLACEHOLDER_TOKEN.to_string(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            local_path: Some(PathBuf::from("./models/pyannote-speaker-diarization-3.1")),
            required_files: vec!["config.yaml".to_string(), "pytorch_model.bin".to_string()],
            model_id: DEFAULT_MODEL_ID.to_string(),
            remote_files: vec!["config.yaml".to_string()],
            hf_token: None,
            cache_dir: None,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            preload: true,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: "auto".to_string(),
            runner: vec!["diarize-runner".to_string()],
            runner_startup_timeout_secs: DEFAULT_RUNNER_STARTUP_TIMEOUT_SECS,
            low_memory_threshold: DEFAULT_LOW_MEMORY_THRESHOLD,
            scratch_dir: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_extensions: ["mp3", "wav", "ogg", "m4a", "flac", "wma"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            model: ModelConfig::default(),
            inference: InferenceConfig::default(),
            upload: UploadConfig::default(),
            proxy: ProxySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}
