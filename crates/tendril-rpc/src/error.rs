use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tendril_consensus::ConsensusError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            RpcError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            RpcError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            RpcError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            RpcError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            RpcError::Consensus(e @ (ConsensusError::QueueFull | ConsensusError::EngineStopped)) => {
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            RpcError::Consensus(e) if e.is_peer_fault() => (StatusCode::BAD_REQUEST, e.to_string()),
            RpcError::Consensus(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        let body = json!({
            "error": message
        });

        (status, axum::Json(body)).into_response()
    }
}
