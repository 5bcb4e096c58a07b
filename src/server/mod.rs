//! The manager's HTTP surface: the WebSocket heartbeat sink plus thin
//! operator shortcuts.

pub mod handlers;
pub mod state;

pub use state::AppState;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/heartbeats/{token}", get(handlers::heartbeats))
        .route("/create_time/{service}", get(handlers::create_vm))
        .route("/ip/{domain_name}", get(handlers::get_ip))
        .route("/delete/{name}", get(handlers::delete_vm))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
