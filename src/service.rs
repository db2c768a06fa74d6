//! The speech-to-text service: composes the registry, capture, backend
//! supervision, transcription and text injection into the session
//! lifecycle, and owns the per-session pipeline tasks.

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use tempfile::TempPath;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{CaptureError, CaptureSupervisor};
use crate::config::ServiceConfig;
use crate::events::{EventEmitter, StopReason};
use crate::inject::{self, TextInjector};
use crate::process;
use crate::registry::{clamp_duration, Session, SessionRegistry, SessionStatus};
use crate::server::{HealthStatus, ServerError, ServerSupervisor};
use crate::transcribe::{ResponseFormat, TranscriptionClient};

/// Capture length used when the caller does not pick one.
pub const DEFAULT_DURATION_SECS: i64 = 60;

/// How long shutdown waits for session tasks before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("missing dependencies: {}", .0.join(", "))]
    MissingDependencies(Vec<String>),
}

/// One service instance. All operations are safe to call concurrently;
/// sessions run on their own tasks and report through the emitter.
pub struct Speech2TextService {
    registry: Arc<SessionRegistry>,
    capture: Arc<CaptureSupervisor>,
    server: Arc<ServerSupervisor>,
    transcriber: Arc<TranscriptionClient>,
    injector: TextInjector,
    emitter: Arc<dyn EventEmitter>,
    tool_cache: Mutex<Option<Vec<String>>>,
    pipelines: Mutex<Vec<JoinHandle<()>>>,
}

impl Speech2TextService {
    pub fn new(config: ServiceConfig, emitter: Arc<dyn EventEmitter>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let capture = Arc::new(CaptureSupervisor::new(
            config.capture.clone(),
            Arc::clone(&registry),
            Arc::clone(&emitter),
        ));
        let transcriber = Arc::new(
            TranscriptionClient::new(config.server.base_url.as_str())
                .with_timeout(config.server.inference_timeout()),
        );
        let server = Arc::new(ServerSupervisor::new(config.server));
        Self {
            registry,
            capture,
            server,
            transcriber,
            injector: TextInjector,
            emitter,
            tool_cache: Mutex::new(None),
            pipelines: Mutex::new(Vec::new()),
        }
    }

    pub fn backend_url(&self) -> &str {
        self.server.base_url()
    }

    /// Makes sure the transcription backend is reachable, starting a
    /// local server when configuration allows. Called at serve startup
    /// and again before each transcription.
    pub async fn ensure_backend(&self) -> Result<bool, ServerError> {
        self.server.ensure_running().await
    }

    /// Starts a capture session and returns its id. The rest of the
    /// pipeline runs on its own task and reports through the emitter.
    pub async fn start_recording(
        &self,
        duration_secs: i64,
        copy_to_clipboard: bool,
        preview_mode: bool,
    ) -> Result<String, ServiceError> {
        let missing = self.missing_capture_tools().await;
        if !missing.is_empty() {
            return Err(ServiceError::MissingDependencies(missing));
        }

        let duration = clamp_duration(duration_secs);
        if i64::from(duration) != duration_secs {
            debug!(
                "Clamped requested duration {}s to {}s",
                duration_secs, duration
            );
        }
        let session = self
            .registry
            .create(duration, copy_to_clipboard, preview_mode)
            .await;
        info!("Starting recording session {} ({}s max)", session.id, duration);

        let pipeline = SessionPipeline {
            registry: Arc::clone(&self.registry),
            capture: Arc::clone(&self.capture),
            server: Arc::clone(&self.server),
            transcriber: Arc::clone(&self.transcriber),
            injector: self.injector,
            emitter: Arc::clone(&self.emitter),
        };
        let id = session.id.clone();
        let handle = tokio::spawn(pipeline.run(session));
        let mut pipelines = self.pipelines.lock().await;
        pipelines.retain(|task| !task.is_finished());
        pipelines.push(handle);
        Ok(id)
    }

    /// Requests a stop. The capture task honors it once the minimum
    /// recording time has passed; transcription still follows. Returns
    /// false for unknown ids, with no side effects.
    pub async fn stop_recording(&self, id: &str) -> bool {
        let accepted = self.registry.mark_stop_requested(id).await;
        if accepted {
            info!("Stop requested for session {}", id);
        } else {
            debug!("Stop requested for unknown session {}", id);
        }
        accepted
    }

    /// Cancels a session outright. The record is removed first so the
    /// pipeline cannot report anything further, then the capture
    /// process gets nudged. Returns false for unknown ids.
    pub async fn cancel_recording(&self, id: &str) -> bool {
        let Some(session) = self.registry.remove(id).await else {
            debug!("Cancel requested for unknown session {}", id);
            return false;
        };
        info!("Cancelling session {}", id);
        if let Some(pid) = session.pid {
            // The capture task also notices the closed stop channel;
            // the signal just makes teardown immediate.
            process::interrupt_pid(pid);
        }
        match session.status {
            SessionStatus::Starting | SessionStatus::Recording | SessionStatus::Stopping => {
                self.emitter.emit_stopped(id, StopReason::Cancelled).await;
            }
            // Past the capture phase a stopped event has already gone
            // out; removing the record is what keeps the pipeline from
            // reporting a result.
            _ => {}
        }
        true
    }

    /// Types caller-provided text as if it had been transcribed,
    /// optionally copying it to the clipboard as well.
    pub async fn type_text(&self, text: &str, copy_to_clipboard: bool) -> bool {
        let typed = self.injector.type_text(text).await;
        self.emitter.emit_typed(text, typed).await;
        if copy_to_clipboard && !self.injector.copy_to_clipboard(text).await {
            warn!("Failed to copy text to clipboard");
        }
        typed
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        self.registry.get(id).await
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.registry.list().await
    }

    pub async fn active_count(&self) -> usize {
        self.registry.active_count().await
    }

    /// One-line status string: `ready:active_recordings=<n>`,
    /// `dependencies_missing:<comma list>`, or `server_error:<detail>`.
    pub async fn service_status(&self) -> String {
        let missing = self.probe_tools().await;
        if !missing.is_empty() {
            return format!("dependencies_missing:{}", missing.join(","));
        }
        let timeout = self.server.settings().health_timeout();
        match self.server.health_check(timeout).await {
            HealthStatus::Ok => {
                format!(
                    "ready:active_recordings={}",
                    self.registry.active_count().await
                )
            }
            HealthStatus::Loading => format!(
                "server_error:whisper server at {} is still loading the model",
                self.server.base_url()
            ),
            HealthStatus::Error(detail) => {
                debug!("Health probe failed: {}", detail);
                format!(
                    "server_error:whisper server not responding at {}",
                    self.server.base_url()
                )
            }
        }
    }

    /// Reports every missing dependency: external tools plus backend
    /// reachability.
    pub async fn check_dependencies(&self) -> (bool, Vec<String>) {
        let mut missing = self.probe_tools().await;
        let timeout = self.server.settings().health_timeout();
        if self.server.health_check(timeout).await != HealthStatus::Ok {
            missing.push(format!(
                "whisper server not responding at {}",
                self.server.base_url()
            ));
        }
        (missing.is_empty(), missing)
    }

    /// Cancels every session, waits briefly for their tasks, then stops
    /// the whisper server if this service started it. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        info!("Shutting down speech-to-text service");
        let sessions = self.registry.list().await;
        for session in &sessions {
            // Removing the record closes its stop channel; capture
            // tasks treat that as cancellation.
            self.registry.remove(&session.id).await;
        }
        if !sessions.is_empty() {
            info!("Cancelled {} active session(s)", sessions.len());
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut pipelines = self.pipelines.lock().await;
            pipelines.drain(..).collect()
        };
        if !handles.is_empty() {
            debug!("Waiting for {} session task(s)", handles.len());
            if tokio::time::timeout(SHUTDOWN_GRACE, future::join_all(handles))
                .await
                .is_err()
            {
                warn!("Session tasks did not finish within {:?}", SHUTDOWN_GRACE);
            }
        }
        self.server.shutdown().await;
    }

    /// Probes for external tools once and caches the result; installing
    /// a tool requires a service restart to be noticed. The backend is
    /// always probed live and is not part of this list.
    async fn probe_tools(&self) -> Vec<String> {
        let mut cache = self.tool_cache.lock().await;
        if let Some(missing) = cache.as_ref() {
            return missing.clone();
        }
        let program = self.capture.settings().program().unwrap_or("ffmpeg");
        let missing = inject::missing_tools(program);
        if !missing.is_empty() {
            warn!("Missing dependencies: {}", missing.join(", "));
        }
        *cache = Some(missing.clone());
        missing
    }

    /// Only the capture tool blocks starting a session; missing typing
    /// or clipboard tools degrade to a failed TextTyped event instead.
    async fn missing_capture_tools(&self) -> Vec<String> {
        let program = self.capture.settings().program();
        self.probe_tools()
            .await
            .into_iter()
            .filter(|entry| Some(entry.as_str()) == program)
            .collect()
    }
}

/// Everything one session task needs, cloned out of the service so the
/// task owns its dependencies outright.
struct SessionPipeline {
    registry: Arc<SessionRegistry>,
    capture: Arc<CaptureSupervisor>,
    server: Arc<ServerSupervisor>,
    transcriber: Arc<TranscriptionClient>,
    injector: TextInjector,
    emitter: Arc<dyn EventEmitter>,
}

/// Why the transcription phase stopped without a result.
enum PhaseFailure {
    /// The record disappeared: cancelled or service shutdown.
    Cancelled,
    /// A real failure, reported as the session's terminal error event.
    Failed(String),
}

impl SessionPipeline {
    /// Runs one session start to finish and retires its record at the
    /// end, whatever happened in between.
    async fn run(self, session: Session) {
        let id = session.id.clone();
        match self.capture.capture(&id).await {
            Ok(audio) => {
                match self.transcribe_and_deliver(&session, &audio).await {
                    Ok(()) => {}
                    Err(PhaseFailure::Cancelled) => {
                        debug!("Session {} cancelled before transcription finished", id);
                    }
                    Err(PhaseFailure::Failed(message)) => {
                        // A failed set_status means the session was
                        // cancelled; its terminal event already went out.
                        if self.registry.set_status(&id, SessionStatus::Failed).await {
                            self.emitter.emit_error(&id, &message).await;
                        }
                    }
                }
                // Snapshots must never point at an unlinked file.
                self.registry.take_audio_path(&id).await;
                if let Err(err) = audio.close() {
                    debug!("Audio file for session {} already gone: {}", id, err);
                }
            }
            Err(CaptureError::Cancelled) => {
                debug!("Session {} cancelled during capture", id);
            }
            Err(err) => {
                // The output file is gone already; the snapshot must not
                // keep pointing at it.
                self.registry.take_audio_path(&id).await;
                if self.registry.set_status(&id, SessionStatus::Failed).await {
                    self.emitter.emit_error(&id, &err.to_string()).await;
                }
            }
        }
        self.registry.remove(&id).await;
        debug!("Session {} retired", id);
    }

    async fn transcribe_and_deliver(
        &self,
        session: &Session,
        audio: &TempPath,
    ) -> Result<(), PhaseFailure> {
        let id = session.id.as_str();
        if !self
            .registry
            .set_status(id, SessionStatus::Transcribing)
            .await
        {
            return Err(PhaseFailure::Cancelled);
        }

        match self.server.ensure_running().await {
            Ok(true) => {}
            Ok(false) => {
                return Err(PhaseFailure::Failed(format!(
                    "whisper server not ready at {}",
                    self.server.base_url()
                )));
            }
            Err(err) => return Err(PhaseFailure::Failed(err.to_string())),
        }

        let text = match self.transcriber.transcribe(audio, ResponseFormat::Json).await {
            Ok(text) => text,
            Err(err) => {
                return Err(PhaseFailure::Failed(format!("Transcription failed: {err}")));
            }
        };

        if !self.registry.set_result(id, &text).await
            || !self
                .registry
                .set_status(id, SessionStatus::Completed)
                .await
        {
            return Err(PhaseFailure::Cancelled);
        }
        info!("Transcription for session {}: {} characters", id, text.len());
        self.emitter.emit_transcription(id, &text).await;

        if session.preview_mode {
            debug!("Preview mode, not typing session {}", id);
        } else {
            let typed = self.injector.type_text(&text).await;
            self.emitter.emit_typed(&text, typed).await;
        }
        if session.copy_to_clipboard && !self.injector.copy_to_clipboard(&text).await {
            warn!(
                "Failed to copy transcription to clipboard for session {}",
                id
            );
        }
        Ok(())
    }
}
