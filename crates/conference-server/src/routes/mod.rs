//! HTTP routes for the conference server.
//!
//! Defines the Axum router and application state.

use crate::actors::RoomRegistryHandle;
use crate::config::Config;
use crate::engine::EngineHub;
use crate::handlers;
use crate::middleware::require_participant;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Request timeout for every HTTP route.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Room registry actor.
    pub registry: RoomRegistryHandle,

    /// Engine legs waiting for their engine process.
    pub engines: Arc<EngineHub>,

    /// Service configuration.
    pub config: Config,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/rooms` - list (GET) and create (POST)
/// - `/rooms/:id` - info (GET) and close (DELETE)
/// - `/rooms/:id/members` - join (POST) and leave (DELETE)
/// - `/ws` - participant signaling socket
/// - `/engines/:id/:kind` - media engine socket (token in the query)
/// - TraceLayer for request logging
/// - 30 second request timeout
pub fn build_routes(state: Arc<AppState>) -> Router {
    // Routes that need the caller's identity
    let participant_routes = Router::new()
        .route("/rooms", get(handlers::list_rooms).post(handlers::create_room))
        .route(
            "/rooms/:id",
            get(handlers::get_room).delete(handlers::close_room),
        )
        .route(
            "/rooms/:id/members",
            post(handlers::join_room).delete(handlers::leave_room),
        )
        .route("/ws", get(handlers::participant_socket))
        .route_layer(middleware::from_fn(require_participant))
        .with_state(state.clone());

    // Engines authenticate with the shared token instead
    let engine_routes = Router::new()
        .route("/engines/:id/:kind", get(handlers::engine_socket))
        .with_state(state);

    participant_routes
        .merge(engine_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
