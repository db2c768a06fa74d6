use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::service_status))
        .route("/dependencies", get(handlers::check_dependencies))
        // Session control
        .route(
            "/sessions",
            post(handlers::start_recording).get(handlers::list_sessions),
        )
        .route("/sessions/:session_id", get(handlers::get_session))
        .route(
            "/sessions/:session_id/stop",
            post(handlers::stop_recording),
        )
        .route(
            "/sessions/:session_id/cancel",
            post(handlers::cancel_recording),
        )
        // Direct text injection
        .route("/type", post(handlers::type_text))
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
