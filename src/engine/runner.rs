//! External runner backend
//!
//! Diarization itself runs in a separate, long-lived runner program started
//! once per model load as
//!
//! ```text
//! <runner...> --serve --model <model-ref>
//! ```
//!
//! The runner loads the model, prints `{"ready": true}` and then answers one
//! JSON line per request on stdin:
//!
//! ```text
//! {"op":"place","device":"cuda:0"}      -> {"ok": true}
//! {"op":"diarize","audio":"/tmp/x.wav"} -> [{"start": 0.0, "end": 1.2, "speaker": "SPEAKER_00"}]
//! ```
//!
//! Any request may be answered with `{"error": "..."}` instead. Stderr is
//! passed through to the service's own.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::device::DeviceDescriptor;
use super::hub::{fetch_snapshot, HubSettings};
use super::pipeline::{DiarizationPipeline, ModelSource, PipelineLoader, RawSegment};
use crate::error::{DiarizationError, Result};

/// How long an exited runner gets to report its status
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Loads pipelines backed by the external runner
pub struct RunnerLoader {
    command: Vec<String>,
    hub: HubSettings,
    hf_token: Option<String>,
    startup_timeout: Duration,
}

impl RunnerLoader {
    pub fn new(command: Vec<String>, hub: HubSettings, hf_token: Option<String>, startup_timeout: Duration) -> Self {
        Self {
            command,
            hub,
            hf_token,
            startup_timeout,
        }
    }
}

#[async_trait]
impl PipelineLoader for RunnerLoader {
    async fn load(&self, source: &ModelSource) -> Result<Box<dyn DiarizationPipeline>> {
        if self.command.is_empty() {
            return Err(DiarizationError::ModelLoadFailure(
                "no runner command configured".to_string(),
            ));
        }

        let model_ref = match source {
            ModelSource::Local { loader_path, .. } => loader_path.clone(),
            ModelSource::Remote {
                model_id,
                token,
                download_timeout,
            } => {
                let snapshot =
                    fetch_snapshot(&self.hub, model_id, token.clone(), *download_timeout).await?;
                snapshot.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/")
            }
        };

        let launch = RunnerLaunch {
            command: self.command.clone(),
            model_ref,
            hf_token: self.hf_token.clone(),
        };
        let process = RunnerProcess::start(&launch, self.startup_timeout)
            .await
            .map_err(DiarizationError::ModelLoadFailure)?;
        info!("Runner ready with model {}", launch.model_ref);

        Ok(Box::new(RunnerPipeline {
            launch,
            device: "cpu".to_string(),
            startup_timeout: self.startup_timeout,
            process: Mutex::new(Some(process)),
        }))
    }
}

/// Everything needed to (re)start the runner
#[derive(Debug, Clone)]
struct RunnerLaunch {
    command: Vec<String>,
    model_ref: String,
    hf_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum RunnerRequest {
    Place { device: String },
    Diarize { audio: String },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RunnerReply {
    Segments(Vec<RawSegment>),
    Failure { error: String },
    Ack { ok: bool },
    Ready { ready: bool },
}

fn parse_reply(line: &str) -> std::result::Result<RunnerReply, String> {
    serde_json::from_str(line.trim()).map_err(|e| format!("unreadable runner reply: {}", e))
}

/// A running runner with its protocol pipes.
///
/// Errors are plain strings describing a broken transport; the caller decides
/// which [`DiarizationError`] they become.
struct RunnerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl RunnerProcess {
    async fn start(launch: &RunnerLaunch, startup_timeout: Duration) -> std::result::Result<Self, String> {
        let (program, args) = launch
            .command
            .split_first()
            .ok_or_else(|| "no runner command configured".to_string())?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--serve")
            .arg("--model")
            .arg(&launch.model_ref)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(ref token) = launch.hf_token {
            cmd.env("HF_TOKEN", token);
        }

        debug!("Starting runner {} for {}", program, launch.model_ref);
        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to start runner `{}`: {}", program, e))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "runner stdin unavailable".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "runner stdout unavailable".to_string())?;

        let mut process = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };

        // Dropping the process on any error kills the child
        let greeting = timeout(startup_timeout, process.read_reply())
            .await
            .map_err(|_| format!("runner not ready after {:?}", startup_timeout))??;
        match greeting {
            RunnerReply::Ready { ready: true } => Ok(process),
            RunnerReply::Failure { error } => Err(error),
            other => Err(format!("unexpected runner greeting: {:?}", other)),
        }
    }

    async fn place(&mut self, device: &str, limit: Duration) -> std::result::Result<(), String> {
        let request = RunnerRequest::Place {
            device: device.to_string(),
        };
        let reply = timeout(limit, self.request(&request))
            .await
            .map_err(|_| format!("runner did not acknowledge {} in time", device))??;
        match reply {
            RunnerReply::Ack { ok: true } => Ok(()),
            RunnerReply::Failure { error } => Err(error),
            other => Err(format!("unexpected reply to placement on {}: {:?}", device, other)),
        }
    }

    async fn request(&mut self, request: &RunnerRequest) -> std::result::Result<RunnerReply, String> {
        let mut line =
            serde_json::to_string(request).map_err(|e| format!("cannot encode runner request: {}", e))?;
        line.push('\n');

        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("runner write failed: {}", e))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| format!("runner write failed: {}", e))?;

        self.read_reply().await
    }

    async fn read_reply(&mut self) -> std::result::Result<RunnerReply, String> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| format!("runner read failed: {}", e))?;
            if read == 0 {
                return Err(self.exit_message().await);
            }
            if !line.trim().is_empty() {
                return parse_reply(&line);
            }
        }
    }

    async fn exit_message(&mut self) -> String {
        match timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => format!("runner exited ({})", status),
            _ => "runner closed its output".to_string(),
        }
    }
}

/// Pipeline handle that talks to one long-lived runner.
///
/// Requests are serialized over the runner's pipes. A runner that dies is
/// restarted (and re-placed) on the next request.
pub struct RunnerPipeline {
    launch: RunnerLaunch,
    device: String,
    startup_timeout: Duration,
    process: Mutex<Option<RunnerProcess>>,
}

impl RunnerPipeline {
    async fn restart(&self) -> std::result::Result<RunnerProcess, String> {
        warn!("Restarting runner for {}", self.launch.model_ref);
        let mut process = RunnerProcess::start(&self.launch, self.startup_timeout).await?;
        process.place(&self.device, self.startup_timeout).await?;
        Ok(process)
    }
}

#[async_trait]
impl DiarizationPipeline for RunnerPipeline {
    async fn place(&mut self, device: &DeviceDescriptor) -> Result<()> {
        let runtime = device.runtime_name();
        if let Some(process) = self.process.get_mut() {
            process
                .place(&runtime, self.startup_timeout)
                .await
                .map_err(DiarizationError::ModelLoadFailure)?;
        }
        self.device = runtime;
        Ok(())
    }

    async fn segment(&self, audio: &Path) -> Result<Vec<RawSegment>> {
        let request = RunnerRequest::Diarize {
            audio: audio.to_string_lossy().into_owned(),
        };

        let mut slot = self.process.lock().await;
        // Taken out while in use: if this future is dropped mid-request the
        // half-spoken runner is killed instead of being reused
        let mut process = match slot.take() {
            Some(process) => process,
            None => self.restart().await.map_err(DiarizationError::Inference)?,
        };

        debug!("Diarizing {:?} on {}", audio, self.device);
        let reply = match process.request(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Runner lost: {}", e);
                return Err(DiarizationError::Inference(e));
            }
        };

        match reply {
            RunnerReply::Segments(segments) => {
                *slot = Some(process);
                Ok(segments)
            }
            RunnerReply::Failure { error } => {
                *slot = Some(process);
                Err(DiarizationError::Inference(error))
            }
            other => Err(DiarizationError::Inference(format!(
                "unexpected runner reply: {:?}",
                other
            ))),
        }
    }
}
