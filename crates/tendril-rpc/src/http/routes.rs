use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    get_commit, get_health, get_round_state, get_status, get_validators,
    receive_consensus_message, submit_tx, AppState,
};

/// Create the HTTP router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/round_state", get(get_round_state))
        .route("/validators", get(get_validators))
        .route("/commit/{height}", get(get_commit))
        .route("/tx", post(submit_tx))
        .route("/consensus/message", post(receive_consensus_message))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
