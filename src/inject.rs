//! Typing transcriptions into the focused window.
//!
//! The tooling differs by display server: Wayland sessions go through
//! ydotool or wtype with wl-copy for the clipboard, X11 sessions use
//! xdotool and xclip/xsel. Everything here is best-effort and reports
//! success as a bool; a missing tool must not fail the transcription
//! pipeline that produced the text.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::process::find_program;

/// Dependency label for the Wayland clipboard tool.
pub const WAYLAND_CLIPBOARD_LABEL: &str = "wl-clipboard (required for Wayland)";
/// Dependency label for the X11 clipboard tools.
pub const X11_CLIPBOARD_LABEL: &str = "clipboard-tools (xclip or xsel for X11)";

/// The display server the desktop session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayServer {
    Wayland,
    X11,
}

impl DisplayServer {
    /// Reads the session type from the process environment.
    pub fn detect() -> Self {
        Self::from_env(
            std::env::var("XDG_SESSION_TYPE").ok().as_deref(),
            std::env::var("WAYLAND_DISPLAY").ok().as_deref(),
            std::env::var("DISPLAY").ok().as_deref(),
        )
    }

    /// `XDG_SESSION_TYPE` wins when set; otherwise a `WAYLAND_DISPLAY`
    /// means Wayland and anything else, including a bare `DISPLAY` or
    /// no display variables at all, is treated as X11.
    pub fn from_env(
        session_type: Option<&str>,
        wayland_display: Option<&str>,
        _display: Option<&str>,
    ) -> Self {
        if let Some(session) = session_type.map(str::trim).filter(|s| !s.is_empty()) {
            return if session.eq_ignore_ascii_case("wayland") {
                Self::Wayland
            } else {
                Self::X11
            };
        }
        if wayland_display.map_or(false, |v| !v.is_empty()) {
            return Self::Wayland;
        }
        Self::X11
    }
}

/// Types and copies text using whatever desktop tooling is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextInjector;

impl TextInjector {
    /// Types `text` into the focused window. Returns whether a tool
    /// accepted it; empty text is never typed.
    pub async fn type_text(&self, text: &str) -> bool {
        if text.is_empty() {
            debug!("Nothing to type");
            return false;
        }
        match DisplayServer::detect() {
            DisplayServer::Wayland => self.type_wayland(text).await,
            DisplayServer::X11 => self.type_x11(text).await,
        }
    }

    /// Places `text` on the clipboard. Empty text is never copied.
    pub async fn copy_to_clipboard(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        match DisplayServer::detect() {
            DisplayServer::Wayland => {
                if pipe_to_tool("wl-copy", &[], text).await {
                    return true;
                }
                // XWayland sessions sometimes only have xclip.
                debug!("wl-copy failed, trying xclip");
                pipe_to_tool("xclip", &["-selection", "clipboard"], text).await
            }
            DisplayServer::X11 => {
                if pipe_to_tool("xclip", &["-selection", "clipboard"], text).await {
                    return true;
                }
                pipe_to_tool("xsel", &["--clipboard", "--input"], text).await
            }
        }
    }

    async fn type_wayland(&self, text: &str) -> bool {
        // ydotool needs its daemon running; wtype talks to the
        // compositor directly and is the fallback.
        if run_tool("ydotool", &["type", text]).await {
            return true;
        }
        debug!("ydotool unavailable, trying wtype");
        let typed = run_tool("wtype", &[text]).await;
        if !typed {
            warn!("No working Wayland typing tool (ydotool or wtype)");
        }
        typed
    }

    async fn type_x11(&self, text: &str) -> bool {
        let typed = run_tool("xdotool", &["type", "--delay", "10", text]).await;
        if !typed {
            warn!("xdotool failed to type the transcription");
        }
        typed
    }
}

/// Names the external tools this session type needs but cannot find.
/// The capture program comes from configuration; typing tools for
/// Wayland are intentionally not listed because clipboard delivery is
/// an accepted fallback there.
pub fn missing_tools(capture_program: &str) -> Vec<String> {
    missing_tools_with(DisplayServer::detect(), capture_program, |name| {
        find_program(name).is_some()
    })
}

/// Testable core of [`missing_tools`]: the display server and tool
/// lookup are injected.
pub fn missing_tools_with(
    display: DisplayServer,
    capture_program: &str,
    exists: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut missing = Vec::new();
    if !exists(capture_program) {
        missing.push(capture_program.to_string());
    }
    match display {
        DisplayServer::Wayland => {
            if !exists("wl-copy") {
                missing.push(WAYLAND_CLIPBOARD_LABEL.to_string());
            }
        }
        DisplayServer::X11 => {
            if !exists("xdotool") {
                missing.push("xdotool".to_string());
            }
            if !exists("xclip") && !exists("xsel") {
                missing.push(X11_CLIPBOARD_LABEL.to_string());
            }
        }
    }
    missing
}

async fn run_tool(program: &str, args: &[&str]) -> bool {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) => status.success(),
        Err(err) => {
            debug!("{program} did not run: {err}");
            false
        }
    }
}

async fn pipe_to_tool(program: &str, args: &[&str], input: &str) -> bool {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            debug!("{program} did not start: {err}");
            return false;
        }
    };
    let written = match child.stdin.take() {
        Some(mut stdin) => stdin.write_all(input.as_bytes()).await.is_ok(),
        None => false,
    };
    // stdin is closed now, so the tool sees EOF and can commit.
    match child.wait().await {
        Ok(status) => written && status.success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_session_type_wins() {
        assert_eq!(
            DisplayServer::from_env(Some("wayland"), None, Some(":0")),
            DisplayServer::Wayland
        );
        assert_eq!(
            DisplayServer::from_env(Some("x11"), Some("wayland-0"), None),
            DisplayServer::X11
        );
        assert_eq!(
            DisplayServer::from_env(Some("tty"), Some("wayland-0"), None),
            DisplayServer::X11
        );
        assert_eq!(
            DisplayServer::from_env(Some("WAYLAND"), None, None),
            DisplayServer::Wayland
        );
    }

    #[test]
    fn test_display_variables_break_ties() {
        assert_eq!(
            DisplayServer::from_env(None, Some("wayland-0"), None),
            DisplayServer::Wayland
        );
        assert_eq!(
            DisplayServer::from_env(Some(""), Some("wayland-1"), None),
            DisplayServer::Wayland
        );
        assert_eq!(
            DisplayServer::from_env(None, None, Some(":0")),
            DisplayServer::X11
        );
        assert_eq!(DisplayServer::from_env(None, None, None), DisplayServer::X11);
        assert_eq!(
            DisplayServer::from_env(None, Some(""), None),
            DisplayServer::X11
        );
    }

    #[test]
    fn test_reports_all_missing_x11_tools() {
        let missing = missing_tools_with(DisplayServer::X11, "ffmpeg", |_| false);
        assert_eq!(
            missing,
            vec![
                "ffmpeg".to_string(),
                "xdotool".to_string(),
                X11_CLIPBOARD_LABEL.to_string(),
            ]
        );
    }

    #[test]
    fn test_either_x11_clipboard_tool_suffices() {
        let missing = missing_tools_with(DisplayServer::X11, "ffmpeg", |name| {
            matches!(name, "ffmpeg" | "xdotool" | "xsel")
        });
        assert!(missing.is_empty());
    }

    #[test]
    fn test_wayland_wants_wl_clipboard_but_not_xdotool() {
        let missing = missing_tools_with(DisplayServer::Wayland, "ffmpeg", |name| name == "ffmpeg");
        assert_eq!(missing, vec![WAYLAND_CLIPBOARD_LABEL.to_string()]);
    }

    #[tokio::test]
    async fn test_empty_text_is_never_delivered() {
        let injector = TextInjector;
        assert!(!injector.type_text("").await);
        assert!(!injector.copy_to_clipboard("").await);
    }
}
