// Event interface between the session pipeline and the outside world.
//
// The core never talks to a transport directly: components emit through
// the EventEmitter trait and the binary decides where events go (logs,
// a channel consumed by the CLI, or whatever shell integration hosts
// the service). Per session, events arrive in the order started →
// (stopped | error) → (transcription | error).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Why a recording stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// The capture ran to its end (duration limit or manual stop).
    Completed,
    /// The session was cancelled; no transcription follows.
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Completed => write!(f, "completed"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Notification sink implemented by the transport layer.
///
/// Implementations must not block the session pipeline; anything slow
/// should buffer internally.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    /// A capture process is up and recording.
    async fn emit_started(&self, session_id: &str);

    /// The capture phase ended. `Completed` means transcription follows;
    /// `Cancelled` is terminal.
    async fn emit_stopped(&self, session_id: &str, reason: StopReason);

    /// Transcription finished. An empty `text` is a valid result; it
    /// means no speech was detected.
    async fn emit_transcription(&self, session_id: &str, text: &str);

    /// The session failed; this is its terminal event.
    async fn emit_error(&self, session_id: &str, message: &str);

    /// Text injection was attempted.
    async fn emit_typed(&self, text: &str, success: bool);
}

/// One session notification, as delivered by [`ChannelEmitter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    RecordingStarted {
        session_id: String,
    },
    RecordingStopped {
        session_id: String,
        reason: StopReason,
    },
    TranscriptionReady {
        session_id: String,
        text: String,
    },
    RecordingError {
        session_id: String,
        message: String,
    },
    TextTyped {
        text: String,
        success: bool,
    },
}

/// Emitter that forwards every event into an unbounded channel. Used by
/// the one-shot CLI runner and by tests that assert on event order.
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SessionEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl EventEmitter for ChannelEmitter {
    async fn emit_started(&self, session_id: &str) {
        self.send(SessionEvent::RecordingStarted {
            session_id: session_id.to_string(),
        });
    }

    async fn emit_stopped(&self, session_id: &str, reason: StopReason) {
        self.send(SessionEvent::RecordingStopped {
            session_id: session_id.to_string(),
            reason,
        });
    }

    async fn emit_transcription(&self, session_id: &str, text: &str) {
        self.send(SessionEvent::TranscriptionReady {
            session_id: session_id.to_string(),
            text: text.to_string(),
        });
    }

    async fn emit_error(&self, session_id: &str, message: &str) {
        self.send(SessionEvent::RecordingError {
            session_id: session_id.to_string(),
            message: message.to_string(),
        });
    }

    async fn emit_typed(&self, text: &str, success: bool) {
        self.send(SessionEvent::TextTyped {
            text: text.to_string(),
            success,
        });
    }
}

/// Emitter that only writes to the log. The default for `serve`, where
/// callers watch session state through the HTTP surface instead of
/// push notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEmitter;

#[async_trait]
impl EventEmitter for TracingEmitter {
    async fn emit_started(&self, session_id: &str) {
        info!("Recording started: {}", session_id);
    }

    async fn emit_stopped(&self, session_id: &str, reason: StopReason) {
        info!("Recording stopped ({}): {}", reason, session_id);
    }

    async fn emit_transcription(&self, session_id: &str, text: &str) {
        info!("Transcription ready for {}: {:?}", session_id, text);
    }

    async fn emit_error(&self, session_id: &str, message: &str) {
        error!("Recording error for {}: {}", session_id, message);
    }

    async fn emit_typed(&self, text: &str, success: bool) {
        info!("Typed {} characters (success: {})", text.len(), success);
    }
}
