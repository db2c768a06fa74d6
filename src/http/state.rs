use crate::service::Speech2TextService;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The service instance every handler delegates to.
    pub service: Arc<Speech2TextService>,
}

impl AppState {
    pub fn new(service: Arc<Speech2TextService>) -> Self {
        Self { service }
    }
}
