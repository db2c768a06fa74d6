pub mod capture;
pub mod config;
pub mod events;
pub mod http;
pub mod inject;
pub mod process;
pub mod registry;
pub mod server;
pub mod service;
pub mod transcribe;

pub use capture::{CaptureError, CaptureSettings, CaptureSupervisor};
pub use config::{HttpSettings, ServiceConfig};
pub use events::{ChannelEmitter, EventEmitter, SessionEvent, StopReason, TracingEmitter};
pub use http::{create_router, AppState};
pub use inject::{DisplayServer, TextInjector};
pub use registry::{clamp_duration, Session, SessionRegistry, SessionStatus};
pub use server::{HealthStatus, ServerError, ServerSettings, ServerSupervisor};
pub use service::{ServiceError, Speech2TextService, DEFAULT_DURATION_SECS};
pub use transcribe::{ResponseFormat, TranscribeError, TranscriptionClient};
