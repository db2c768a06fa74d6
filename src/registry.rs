// Session registry: the single source of truth for active sessions.
//
// Every mutation goes through this object. Session tasks, the HTTP
// handlers, and the service control operations all share one registry,
// so each method takes the map lock for the whole mutation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

/// Shortest capture accepted, in seconds.
pub const MIN_DURATION_SECS: u32 = 1;
/// Longest capture accepted, in seconds (5 minutes).
pub const MAX_DURATION_SECS: u32 = 300;

/// Clamps a requested duration to the supported range.
pub fn clamp_duration(requested: i64) -> u32 {
    requested.clamp(i64::from(MIN_DURATION_SECS), i64::from(MAX_DURATION_SECS)) as u32
}

/// Lifecycle states of a session.
///
/// Transitions only move forward: Starting → Recording → Stopping →
/// Recorded → Transcribing → Completed, with Failed and Cancelled as
/// the other terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Recording,
    Stopping,
    Recorded,
    Transcribing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Terminal states retire the session record.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States counted as "active" in the service status string.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Recording | Self::Transcribing)
    }
}

/// One capture/transcribe attempt.
///
/// This is the snapshot handed out by the registry; the authoritative
/// copy lives inside the registry map and is only mutated through it.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    /// Unique session identifier, generated at creation.
    pub id: String,
    pub status: SessionStatus,
    /// Capture duration in seconds, already clamped.
    pub duration_secs: u32,
    /// Copy the transcription to the clipboard when done.
    pub copy_to_clipboard: bool,
    /// Report the transcription without typing it.
    pub preview_mode: bool,
    /// Set by a caller-initiated stop; honored by the capture task.
    pub stop_requested: bool,
    /// Output file of the capture process, once created.
    pub audio_file_path: Option<PathBuf>,
    /// Pid of the capture process while it is alive.
    pub pid: Option<u32>,
    /// Transcribed text, populated on completion.
    pub result_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Registry entry: the session plus its stop-signal channel. Dropping
/// the entry closes the channel, which the capture task treats as a
/// cancellation notice.
struct SessionRecord {
    session: Session,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

/// Concurrency-safe map of session id → session state.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a session record with a fresh id and returns a snapshot
    /// of it. Ids are random UUIDs and never reused.
    pub async fn create(
        &self,
        duration_secs: u32,
        copy_to_clipboard: bool,
        preview_mode: bool,
    ) -> Session {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            status: SessionStatus::Starting,
            duration_secs,
            copy_to_clipboard,
            preview_mode,
            stop_requested: false,
            audio_file_path: None,
            pid: None,
            result_text: None,
            created_at: Utc::now(),
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let record = SessionRecord {
            session: session.clone(),
            stop_tx,
            stop_rx,
        };

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id.clone(), record);
        session
    }

    /// Returns a snapshot of the session, if it still exists.
    pub async fn get(&self, id: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.get(id).map(|record| record.session.clone())
    }

    /// Snapshots of all live sessions, oldest first.
    pub async fn list(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<Session> = sessions
            .values()
            .map(|record| record.session.clone())
            .collect();
        list.sort_by_key(|session| session.created_at);
        list
    }

    /// Number of sessions currently recording or transcribing.
    pub async fn active_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|record| record.session.status.is_active())
            .count()
    }

    /// Updates the session status. Returns false when the session no
    /// longer exists, which callers treat as "cancelled underneath us".
    pub async fn set_status(&self, id: &str, status: SessionStatus) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(record) => {
                record.session.status = status;
                true
            }
            None => false,
        }
    }

    /// Records (or clears) the pid of the in-flight capture process.
    pub async fn set_pid(&self, id: &str, pid: Option<u32>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(record) => {
                record.session.pid = pid;
                true
            }
            None => false,
        }
    }

    /// Records where the capture process writes its output.
    pub async fn set_audio_path(&self, id: &str, path: PathBuf) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(record) => {
                record.session.audio_file_path = Some(path);
                true
            }
            None => false,
        }
    }

    /// Clears and returns the recorded audio path. The pipeline calls
    /// this right before unlinking the file so a snapshot never points
    /// at a path that is already gone.
    pub async fn take_audio_path(&self, id: &str) -> Option<PathBuf> {
        let mut sessions = self.sessions.write().await;
        sessions
            .get_mut(id)
            .and_then(|record| record.session.audio_file_path.take())
    }

    /// Stores the transcription result.
    pub async fn set_result(&self, id: &str, text: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(record) => {
                record.session.result_text = Some(text.to_string());
                true
            }
            None => false,
        }
    }

    /// Flags the session to stop and wakes its capture task. Returns
    /// false for unknown ids, with no side effects.
    pub async fn mark_stop_requested(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(record) => {
                record.session.stop_requested = true;
                record.stop_tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// A receiver for the session's stop signal. The capture task waits
    /// on this instead of polling the flag; a closed channel means the
    /// record was removed.
    pub async fn stop_signal(&self, id: &str) -> Option<watch::Receiver<bool>> {
        let sessions = self.sessions.read().await;
        sessions.get(id).map(|record| record.stop_rx.clone())
    }

    /// Removes the session and returns its final snapshot. Removing an
    /// unknown id is a no-op. Dropping the record closes the stop
    /// channel, which tells a still-running capture task to tear down.
    pub async fn remove(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(id).map(|record| record.session)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
