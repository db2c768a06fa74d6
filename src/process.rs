// External process plumbing: shutdown ladders and PATH lookup.
//
// Capture tools and the whisper server are external processes that may
// need escalating persuasion to exit: an in-band quit request, SIGINT,
// SIGTERM, and finally SIGKILL. Each rung waits a bounded time and the
// whole ladder short-circuits as soon as the process is confirmed gone.
// A process that is already dead at any rung counts as success.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, warn};

/// One rung of the shutdown escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// Write `q\n` to stdin and close it. ffmpeg finalizes its output
    /// file on this, so it comes first for capture processes.
    Quit,
    /// SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGKILL (portable kill).
    Kill,
}

/// An action plus how long to wait for the process to react to it.
#[derive(Debug, Clone, Copy)]
pub struct StopStep {
    pub action: StopAction,
    pub wait: Duration,
}

impl StopStep {
    pub fn new(action: StopAction, wait: Duration) -> Self {
        Self { action, wait }
    }
}

/// The full escalation used when stopping a capture process.
pub fn capture_ladder() -> Vec<StopStep> {
    vec![
        StopStep::new(StopAction::Quit, Duration::from_secs(2)),
        StopStep::new(StopAction::Interrupt, Duration::from_secs(2)),
        StopStep::new(StopAction::Terminate, Duration::from_secs(2)),
        StopStep::new(StopAction::Kill, Duration::from_secs(2)),
    ]
}

/// Impatient variant used when a session is cancelled or the service is
/// shutting down and nobody is waiting on the output file.
pub fn cancel_ladder() -> Vec<StopStep> {
    vec![
        StopStep::new(StopAction::Interrupt, Duration::from_millis(200)),
        StopStep::new(StopAction::Terminate, Duration::from_millis(200)),
        StopStep::new(StopAction::Kill, Duration::from_secs(1)),
    ]
}

/// Graceful-then-forceful ladder for a server process we spawned.
pub fn server_ladder() -> Vec<StopStep> {
    vec![
        StopStep::new(StopAction::Terminate, Duration::from_secs(5)),
        StopStep::new(StopAction::Kill, Duration::from_secs(2)),
    ]
}

/// Runs `steps` against `child` in order, short-circuiting once the
/// process exits. Rungs whose delivery fails (no stdin, process gone,
/// signals unsupported) are skipped without their wait.
pub async fn stop_process(child: &mut Child, steps: &[StopStep]) -> std::io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    for step in steps {
        let delivered = match step.action {
            StopAction::Quit => request_quit(child).await,
            StopAction::Interrupt => interrupt(child),
            StopAction::Terminate => terminate(child),
            StopAction::Kill => child.start_kill().is_ok(),
        };

        if !delivered {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            debug!("{:?} not deliverable, escalating", step.action);
            continue;
        }

        match timeout(step.wait, child.wait()).await {
            Ok(status) => {
                debug!("process exited after {:?}", step.action);
                return status;
            }
            Err(_) => warn!(
                "process ignored {:?} for {:?}, escalating",
                step.action, step.wait
            ),
        }
    }

    // Ladder exhausted; make sure the kill actually lands.
    child.start_kill().ok();
    child.wait().await
}

/// Sends `q\n` on stdin and closes the pipe. Returns false when stdin
/// is not piped or the process has already gone away.
async fn request_quit(child: &mut Child) -> bool {
    let Some(mut stdin) = child.stdin.take() else {
        return false;
    };
    let written = stdin.write_all(b"q\n").await.is_ok() && stdin.flush().await.is_ok();
    // Dropping stdin closes the pipe, so the process also sees EOF.
    drop(stdin);
    written
}

/// SIGINT to a live child. False when the process is gone or signals
/// are unsupported on this platform.
pub(crate) fn interrupt(child: &Child) -> bool {
    signal_child(child, SIGINT)
}

/// SIGTERM to a live child.
pub(crate) fn terminate(child: &Child) -> bool {
    signal_child(child, SIGTERM)
}

/// Best-effort SIGINT by raw pid, for when the `Child` handle lives on
/// another task and only the registry's pid snapshot is available.
pub(crate) fn interrupt_pid(pid: u32) -> bool {
    signal_pid(pid, SIGINT)
}

#[cfg(unix)]
const SIGINT: i32 = libc::SIGINT;
#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;

#[cfg(not(unix))]
const SIGINT: i32 = 2;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;

fn signal_child(child: &Child, signal: i32) -> bool {
    match child.id() {
        Some(pid) => signal_pid(pid, signal),
        None => false,
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: i32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _signal: i32) -> bool {
    false
}

/// Locates an executable by scanning PATH, like `which`.
pub fn find_program(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
