//! Whisper server supervision.
//!
//! The transcription backend is a separate `whisper-server` process
//! speaking HTTP. This module health-checks it, starts it on demand
//! when it is local and auto-start is enabled, and stops it again on
//! service shutdown. Remote servers are only ever observed, never
//! managed.

mod models;

pub use models::{default_cache_dir, discover_vad_model, resolve_model_path, resolve_vad_model};

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::process;

/// Program looked up on PATH when no explicit binary is configured.
const SERVER_PROGRAM: &str = "whisper-server";

/// Recent child output kept for early-exit diagnostics.
const OUTPUT_LOG_LINES: usize = 64;

/// Transcription backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Base URL of the whisper server, e.g. `http://127.0.0.1:8080`.
    pub base_url: String,
    /// Model name without the `ggml-` prefix or `.bin` suffix.
    pub model: String,
    /// Language passed to the server (`auto` for detection).
    pub language: String,
    /// VAD model name, `auto` to discover one, `none` to disable.
    pub vad_model: String,
    /// Start a local server when it is not already running.
    pub auto_start: bool,
    /// Model cache directory; defaults to `~/.cache/whisper.cpp`.
    pub cache_dir: Option<PathBuf>,
    /// Explicit server binary; defaults to `whisper-server` on PATH.
    pub server_binary: Option<PathBuf>,
    pub health_timeout_secs: f64,
    pub startup_wait_secs: f64,
    pub startup_poll_secs: f64,
    pub inference_timeout_secs: f64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            model: "base.en".to_string(),
            language: "auto".to_string(),
            vad_model: "auto".to_string(),
            auto_start: true,
            cache_dir: None,
            server_binary: None,
            health_timeout_secs: 2.0,
            startup_wait_secs: 10.0,
            startup_poll_secs: 0.5,
            inference_timeout_secs: 30.0,
        }
    }
}

impl ServerSettings {
    /// Applies the `WHISPER_*` environment keys recognized across the
    /// whisper.cpp ecosystem. `vars` is injected so tests do not have
    /// to mutate the process environment.
    pub fn overlay(&mut self, vars: impl Fn(&str) -> Option<String>) {
        if let Some(value) = vars("WHISPER_SERVER_URL") {
            self.base_url = value;
        }
        if let Some(value) = vars("WHISPER_MODEL") {
            self.model = value;
        }
        if let Some(value) = vars("WHISPER_LANGUAGE") {
            self.language = value;
        }
        if let Some(value) = vars("WHISPER_VAD_MODEL") {
            self.vad_model = value;
        }
        if let Some(value) = vars("WHISPER_AUTO_START") {
            self.auto_start = parse_enabled(&value);
        }
    }

    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.health_timeout_secs.max(0.0))
    }

    pub fn startup_wait(&self) -> Duration {
        Duration::from_secs_f64(self.startup_wait_secs.max(0.0))
    }

    pub fn startup_poll(&self) -> Duration {
        Duration::from_secs_f64(self.startup_poll_secs.max(0.0))
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.inference_timeout_secs.max(0.0))
    }
}

/// Anything except an explicit off-value enables a boolean flag.
pub fn parse_enabled(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "false" | "0" | "no" | "off"
    )
}

/// Result of probing the server's `/health` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Server is up and the model is loaded.
    Ok,
    /// Server is up but still loading the model.
    Loading,
    /// Server unreachable or reporting a failure.
    Error(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(
        "whisper model '{model}' not found at {}; download it with whisper.cpp's \
         download-ggml-model.sh script",
        .path.display()
    )]
    ModelNotFound { model: String, path: PathBuf },
    #[error("VAD model not found at {}", .path.display())]
    VadModelNotFound { path: PathBuf },
    #[error("whisper-server binary not found at {}", .path.display())]
    BinaryNotFound { path: PathBuf },
    #[error("whisper-server not found on PATH; install whisper.cpp and its server binary")]
    BinaryMissing,
    #[error("whisper server URL '{url}' is invalid: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to spawn whisper-server: {0}")]
    SpawnFailed(#[source] std::io::Error),
    #[error("whisper-server exited before becoming ready ({status}): {output}")]
    ExitedEarly { status: String, output: String },
}

/// A server process this supervisor spawned, plus a rolling capture of
/// its recent output for diagnostics.
struct ManagedServer {
    child: Child,
    output: Arc<StdMutex<VecDeque<String>>>,
}

impl ManagedServer {
    fn output_snapshot(&self) -> String {
        match self.output.lock() {
            Ok(lines) => lines.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => String::new(),
        }
    }
}

enum ReadyOutcome {
    Ready,
    TimedOut,
    Exited(std::process::ExitStatus),
}

/// Owns the lifecycle of the local whisper server process.
pub struct ServerSupervisor {
    settings: ServerSettings,
    http: Client,
    child: Mutex<Option<ManagedServer>>,
}

impl ServerSupervisor {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            http: Client::new(),
            child: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    /// True when the configured URL points at this machine. Anything
    /// unparseable is treated as remote so we never spawn for it.
    pub fn is_local(&self) -> bool {
        match reqwest::Url::parse(&self.settings.base_url) {
            Ok(url) => is_loopback_host(url.host_str()),
            Err(_) => false,
        }
    }

    /// Probes `GET /health` and classifies the answer.
    pub async fn health_check(&self, timeout: Duration) -> HealthStatus {
        let url = format!("{}/health", self.settings.base_url.trim_end_matches('/'));
        let response = match self.http.get(&url).timeout(timeout).send().await {
            Ok(response) => response,
            Err(err) => return HealthStatus::Error(err.to_string()),
        };
        match response.status() {
            StatusCode::OK => match response.json::<HealthBody>().await {
                Ok(body) => match body.status.as_deref() {
                    Some("ok") => HealthStatus::Ok,
                    Some(other) => {
                        HealthStatus::Error(format!("unexpected health status '{other}'"))
                    }
                    None => HealthStatus::Error("health response missing status".to_string()),
                },
                Err(err) => HealthStatus::Error(format!("invalid health response: {err}")),
            },
            StatusCode::SERVICE_UNAVAILABLE => HealthStatus::Loading,
            status => HealthStatus::Error(format!("health endpoint returned {status}")),
        }
    }

    /// Makes sure a transcription backend is reachable. Returns whether
    /// it is ready. Spawns `whisper-server` only for a local URL with
    /// auto-start enabled; remote servers just get probed.
    pub async fn ensure_running(&self) -> Result<bool, ServerError> {
        let timeout = self.settings.health_timeout();
        if self.health_check(timeout).await == HealthStatus::Ok {
            return Ok(true);
        }
        if !self.is_local() || !self.settings.auto_start {
            return Ok(false);
        }

        let mut slot = self.child.lock().await;
        // Another session may have finished starting the server while
        // we waited for the lock.
        if self.health_check(timeout).await == HealthStatus::Ok {
            return Ok(true);
        }

        if let Some(server) = slot.as_mut() {
            match server.child.try_wait() {
                Ok(Some(status)) => {
                    warn!("Previously started whisper-server exited ({status})");
                    *slot = None;
                }
                Ok(None) => {
                    // An earlier spawn is still loading the model; give
                    // it another readiness window instead of starting a
                    // second server.
                    return match self.wait_until_ready(server).await {
                        ReadyOutcome::Ready => Ok(true),
                        ReadyOutcome::TimedOut => Ok(false),
                        ReadyOutcome::Exited(status) => {
                            sleep(Duration::from_millis(100)).await;
                            let output = server.output_snapshot();
                            *slot = None;
                            Err(ServerError::ExitedEarly {
                                status: status.to_string(),
                                output,
                            })
                        }
                    };
                }
                Err(_) => {
                    *slot = None;
                }
            }
        }

        let cache_dir = self.settings.resolved_cache_dir();
        let model_path = resolve_model_path(&cache_dir, &self.settings.model)?;
        let vad_path = resolve_vad_model(&cache_dir, &self.settings.vad_model)?;
        let mut server = self.spawn_server(&model_path, vad_path.as_deref())?;

        match self.wait_until_ready(&mut server).await {
            ReadyOutcome::Ready => {
                info!("whisper-server is ready at {}", self.settings.base_url);
                *slot = Some(server);
                Ok(true)
            }
            ReadyOutcome::TimedOut => {
                warn!(
                    "whisper-server not ready after {:?}; it may still be loading",
                    self.settings.startup_wait()
                );
                // Keep the handle: shutdown must still reap it and it
                // may finish loading in time for a later session.
                *slot = Some(server);
                Ok(false)
            }
            ReadyOutcome::Exited(status) => {
                // Let the drain tasks flush the final output lines.
                sleep(Duration::from_millis(100)).await;
                Err(ServerError::ExitedEarly {
                    status: status.to_string(),
                    output: server.output_snapshot(),
                })
            }
        }
    }

    /// Stops the server process this supervisor started, if any.
    /// Servers found already running stay untouched. Idempotent.
    pub async fn shutdown(&self) {
        let mut slot = self.child.lock().await;
        let Some(mut server) = slot.take() else {
            return;
        };
        info!("Stopping whisper-server (pid {:?})", server.child.id());
        if let Err(err) = process::stop_process(&mut server.child, &process::server_ladder()).await
        {
            warn!("Failed to stop whisper-server cleanly: {err}");
        }
    }

    fn spawn_server(&self, model: &Path, vad: Option<&Path>) -> Result<ManagedServer, ServerError> {
        let binary = self.resolve_binary()?;
        let url = reqwest::Url::parse(&self.settings.base_url).map_err(|err| {
            ServerError::InvalidUrl {
                url: self.settings.base_url.clone(),
                reason: err.to_string(),
            }
        })?;
        let host = url
            .host_str()
            .unwrap_or("127.0.0.1")
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(8080);

        let mut command = Command::new(&binary);
        command
            .arg("-m")
            .arg(model)
            .arg("-l")
            .arg(&self.settings.language)
            .arg("--host")
            .arg(&host)
            .arg("--port")
            .arg(port.to_string());
        if let Some(vad) = vad {
            command.arg("--vad").arg("-vm").arg(vad);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(ServerError::SpawnFailed)?;
        info!(
            "Started whisper-server (pid {:?}) with model {}",
            child.id(),
            model.display()
        );
        if let Some(vad) = vad {
            info!("Voice activity detection enabled with {}", vad.display());
        }

        let output = Arc::new(StdMutex::new(VecDeque::new()));
        if let Some(stdout) = child.stdout.take() {
            drain_lines(stdout, Arc::clone(&output));
        }
        if let Some(stderr) = child.stderr.take() {
            drain_lines(stderr, Arc::clone(&output));
        }
        Ok(ManagedServer { child, output })
    }

    fn resolve_binary(&self) -> Result<PathBuf, ServerError> {
        if let Some(path) = &self.settings.server_binary {
            return if path.is_file() {
                Ok(path.clone())
            } else {
                Err(ServerError::BinaryNotFound { path: path.clone() })
            };
        }
        process::find_program(SERVER_PROGRAM).ok_or(ServerError::BinaryMissing)
    }

    async fn wait_until_ready(&self, server: &mut ManagedServer) -> ReadyOutcome {
        let deadline = Instant::now() + self.settings.startup_wait();
        loop {
            sleep(self.settings.startup_poll()).await;
            if let Ok(Some(status)) = server.child.try_wait() {
                return ReadyOutcome::Exited(status);
            }
            if self.health_check(self.settings.health_timeout()).await == HealthStatus::Ok {
                return ReadyOutcome::Ready;
            }
            if Instant::now() >= deadline {
                return ReadyOutcome::TimedOut;
            }
        }
    }
}

#[derive(Deserialize)]
struct HealthBody {
    status: Option<String>,
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "::1"
}

/// Forwards child output to the debug log while keeping a bounded tail
/// for early-exit error messages.
fn drain_lines<R>(reader: R, sink: Arc<StdMutex<VecDeque<String>>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("whisper-server: {line}");
            if let Ok(mut sink) = sink.lock() {
                if sink.len() >= OUTPUT_LOG_LINES {
                    sink.pop_front();
                }
                sink.push_back(line);
            }
        }
    });
}
