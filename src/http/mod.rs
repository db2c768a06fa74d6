//! HTTP API server for external control (shell extensions, scripts)
//!
//! This module provides a REST API for driving recording sessions:
//! - POST /sessions - Start a recording session
//! - GET /sessions - List live sessions
//! - GET /sessions/:id - Query one session
//! - POST /sessions/:id/stop - Stop recording; transcription follows
//! - POST /sessions/:id/cancel - Cancel without transcribing
//! - POST /type - Type caller-provided text
//! - GET /status - Service status string
//! - GET /dependencies - External tool and backend checks
//! - GET /health - Liveness check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
