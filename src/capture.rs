// Capture supervisor: runs one audio capture attempt end-to-end.
//
// Each session gets its own task that spawns the capture process
// (ffmpeg against the default PulseAudio source unless configured
// otherwise), waits for it to finish or be stopped, walks the shutdown
// ladder when needed, and validates the output file before handing it
// to transcription.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::events::{EventEmitter, StopReason};
use crate::process;
use crate::registry::{SessionRegistry, SessionStatus};

/// Tunables for the capture phase.
///
/// The minimum recording time and the validation knobs have no derived
/// correct values; the defaults are what proved workable against
/// PulseAudio capture, kept configurable rather than baked in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Program and arguments spawned to record one session. The
    /// placeholders `{output}` and `{duration}` are substituted with
    /// the session's output file and clamped duration.
    pub command: Vec<String>,
    /// Seconds the capture process is guaranteed to run before a stop
    /// request is honored, so the audio stack can finish initializing.
    pub min_recording_secs: f64,
    /// Liveness poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Delay before the first output check, letting the filesystem
    /// flush what the process wrote.
    pub settle_delay_ms: u64,
    /// How many existence/size checks to attempt before giving up.
    pub validation_attempts: u32,
    /// Delay between validation attempts, in milliseconds.
    pub validation_backoff_ms: u64,
    /// Output files at or below this many bytes are rejected; a bare
    /// WAV header with no samples falls under it.
    pub min_output_bytes: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            command: default_capture_command(),
            min_recording_secs: 2.0,
            poll_interval_ms: 100,
            settle_delay_ms: 300,
            validation_attempts: 5,
            validation_backoff_ms: 200,
            min_output_bytes: 100,
        }
    }
}

impl CaptureSettings {
    /// The executable the capture command runs, for dependency checks.
    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }
}

/// ffmpeg recording from the default PulseAudio source, tuned for
/// short recordings: aggressive packet flushing so the file is usable
/// even when the process is stopped early, 16kHz mono as whisper
/// expects.
fn default_capture_command() -> Vec<String> {
    [
        "ffmpeg",
        "-y",
        "-hide_banner",
        "-nostats",
        "-loglevel",
        "error",
        "-f",
        "pulse",
        "-i",
        "default",
        "-flush_packets",
        "1",
        "-bufsize",
        "32k",
        "-avioflags",
        "direct",
        "-fflags",
        "+flush_packets",
        "-t",
        "{duration}",
        "-ar",
        "16000",
        "-ac",
        "1",
        "-f",
        "wav",
        "{output}",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to start capture process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("capture process failed to start ({status}): {stderr}")]
    StartupFailed { status: String, stderr: String },

    #[error("no audio captured or file too small (exists={exists}, size={size} bytes)")]
    InvalidOutput { exists: bool, size: u64 },

    /// The session record disappeared while capturing, meaning the
    /// session was cancelled. Not reported as an error event.
    #[error("session was cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How the wait phase ended.
enum WaitOutcome {
    /// The process exited on its own (duration limit or crash).
    Exited(ExitStatus),
    /// Stop was requested and the minimum recording time has elapsed.
    StopElapsed,
    /// The session record was removed underneath us.
    Cancelled,
}

/// Spawns and supervises capture processes, one per session task.
pub struct CaptureSupervisor {
    settings: CaptureSettings,
    registry: Arc<SessionRegistry>,
    emitter: Arc<dyn EventEmitter>,
}

impl CaptureSupervisor {
    pub fn new(
        settings: CaptureSettings,
        registry: Arc<SessionRegistry>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            settings,
            registry,
            emitter,
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Runs one capture attempt and returns the validated output file.
    /// The returned handle unlinks the file when dropped, so ownership
    /// moving through the pipeline is also the cleanup path.
    ///
    /// Emits `started` once the process is up and `stopped(completed)`
    /// once the output validates. `Err(Cancelled)` means the session
    /// was retired externally and everything was cleaned up quietly.
    pub async fn capture(&self, session_id: &str) -> Result<TempPath, CaptureError> {
        let Some(session) = self.registry.get(session_id).await else {
            return Err(CaptureError::Cancelled);
        };
        let Some(mut stop_rx) = self.registry.stop_signal(session_id).await else {
            return Err(CaptureError::Cancelled);
        };

        // The capture process overwrites this file; keeping the handle
        // as TempPath means any exit from here removes it.
        let output = tempfile::Builder::new()
            .prefix("speech2text-")
            .suffix(".wav")
            .tempfile()?
            .into_temp_path();

        if !self
            .registry
            .set_audio_path(session_id, output.to_path_buf())
            .await
        {
            return Err(CaptureError::Cancelled);
        }

        let argv = substitute_command(&self.settings.command, &output, session.duration_secs);
        let (program, args) = argv.split_first().ok_or_else(|| {
            CaptureError::SpawnFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "capture command is empty",
            ))
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CaptureError::SpawnFailed)?;

        info!(
            "Capture process started for session {} (pid {:?}, {}s max)",
            session_id,
            child.id(),
            session.duration_secs
        );

        // Drain stderr concurrently so the process can never block on a
        // full pipe; the content is only read back for diagnostics.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut collected).await;
            }
            collected
        });

        let poll_interval = Duration::from_millis(self.settings.poll_interval_ms);
        let min_deadline =
            Instant::now() + Duration::from_secs_f64(self.settings.min_recording_secs.max(0.0));

        // A tool that dies straight away (bad device, unusable flags)
        // is reported with its stderr, the only useful diagnostic.
        sleep(poll_interval).await;
        if let Some(status) = child.try_wait()? {
            if !status.success() {
                let stderr_output = stderr_task.await.unwrap_or_default();
                return Err(CaptureError::StartupFailed {
                    status: status.to_string(),
                    stderr: stderr_output.trim().to_string(),
                });
            }
        }

        if !self.registry.set_pid(session_id, child.id()).await
            || !self
                .registry
                .set_status(session_id, SessionStatus::Recording)
                .await
        {
            abort_capture(&mut child).await;
            return Err(CaptureError::Cancelled);
        }
        self.emitter.emit_started(session_id).await;

        let mut stop_requested = *stop_rx.borrow();
        let outcome = loop {
            if stop_requested {
                // Honor the stop only once the minimum recording time
                // has passed; stopping ffmpeg during stream setup
                // produces an unreadable file.
                tokio::select! {
                    status = child.wait() => break WaitOutcome::Exited(status?),
                    _ = sleep_until(min_deadline) => break WaitOutcome::StopElapsed,
                    changed = stop_rx.changed() => {
                        if changed.is_err() {
                            break WaitOutcome::Cancelled;
                        }
                    }
                }
            } else {
                tokio::select! {
                    status = child.wait() => break WaitOutcome::Exited(status?),
                    changed = stop_rx.changed() => match changed {
                        Ok(()) => {
                            stop_requested = *stop_rx.borrow_and_update();
                            if stop_requested && Instant::now() < min_deadline {
                                debug!(
                                    "Deferring stop for session {} until minimum recording time",
                                    session_id
                                );
                            }
                        }
                        Err(_) => break WaitOutcome::Cancelled,
                    }
                }
            }
        };

        let exit_status = match outcome {
            WaitOutcome::Exited(status) => status,
            WaitOutcome::StopElapsed => {
                if !self
                    .registry
                    .set_status(session_id, SessionStatus::Stopping)
                    .await
                {
                    abort_capture(&mut child).await;
                    return Err(CaptureError::Cancelled);
                }
                info!("Stopping capture process for session {}", session_id);
                process::stop_process(&mut child, &process::capture_ladder()).await?
            }
            WaitOutcome::Cancelled => {
                debug!("Session {} cancelled, tearing down capture", session_id);
                abort_capture(&mut child).await;
                return Err(CaptureError::Cancelled);
            }
        };

        // A cancel signal can make the process exit before the closed
        // stop channel is observed; the missing record is what tells
        // the two cases apart.
        if !self.registry.set_pid(session_id, None).await {
            return Err(CaptureError::Cancelled);
        }

        let stderr_output = stderr_task.await.unwrap_or_default();
        if !stderr_output.trim().is_empty() {
            debug!(
                "Capture stderr for session {}: {}",
                session_id,
                stderr_output.trim()
            );
        }
        if !exit_status.success() {
            debug!(
                "Capture process for session {} exited with {}",
                session_id, exit_status
            );
        }

        let (valid, exists, size) = self.validate_output(&output).await;
        if !valid {
            warn!(
                "Audio validation failed for session {}: exists={}, size={} bytes",
                session_id, exists, size
            );
            return Err(CaptureError::InvalidOutput { exists, size });
        }
        debug!(
            "Audio validated for session {}: {} bytes at {}",
            session_id,
            size,
            output.display()
        );

        if !self
            .registry
            .set_status(session_id, SessionStatus::Recorded)
            .await
        {
            return Err(CaptureError::Cancelled);
        }
        self.emitter
            .emit_stopped(session_id, StopReason::Completed)
            .await;

        Ok(output)
    }

    /// Retries existence and size checks until the output either passes
    /// the minimum size or the attempts run out. Returns what was
    /// observed so failures can say exactly what was on disk.
    async fn validate_output(&self, output: &TempPath) -> (bool, bool, u64) {
        sleep(Duration::from_millis(self.settings.settle_delay_ms)).await;

        let mut exists = false;
        let mut size = 0u64;
        for attempt in 1..=self.settings.validation_attempts {
            match tokio::fs::metadata(output).await {
                Ok(metadata) => {
                    exists = true;
                    size = metadata.len();
                    if size > self.settings.min_output_bytes {
                        return (true, exists, size);
                    }
                    debug!(
                        "Validation attempt {}: file too small ({} bytes)",
                        attempt, size
                    );
                }
                Err(_) => {
                    exists = false;
                    size = 0;
                    debug!("Validation attempt {}: file does not exist yet", attempt);
                }
            }
            if attempt < self.settings.validation_attempts {
                sleep(Duration::from_millis(self.settings.validation_backoff_ms)).await;
            }
        }
        (false, exists, size)
    }
}

/// Fills the per-session placeholders in the configured command.
fn substitute_command(template: &[String], output: &TempPath, duration_secs: u32) -> Vec<String> {
    let output = output.to_string_lossy();
    let duration = duration_secs.to_string();
    template
        .iter()
        .map(|arg| arg.replace("{output}", &output).replace("{duration}", &duration))
        .collect()
}

/// Tears a capture process down without caring about its output.
async fn abort_capture(child: &mut Child) {
    if let Err(err) = process::stop_process(child, &process::cancel_ladder()).await {
        warn!("Error reaping cancelled capture process: {}", err);
    }
}
