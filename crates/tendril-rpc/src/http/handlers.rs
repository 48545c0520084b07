use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tendril_consensus::{ConsensusHandle, EngineStatus, MsgInfo, RoundStateSummary};
use tendril_core::{tx_hash, Commit, Height, Round};
use tracing::{debug, info};

use crate::error::RpcError;
use crate::TxSink;

/// Application state shared with handlers
pub struct AppState {
    pub consensus: ConsensusHandle,
    pub mempool: Option<Arc<dyn TxSink>>,
}

// Response types

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub chain_id: String,
    pub node_id: String,
    pub engine: EngineStatus,
    pub latest_block_height: Height,
    pub latest_block_hash: Option<String>,
    pub latest_block_time: u64,
    pub app_hash: String,
    pub height: Height,
    pub round: Round,
    pub step: String,
    pub pending_txs: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub address: String,
    pub pub_key: String,
    pub voting_power: u64,
    pub accum: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidatorsResponse {
    pub height: Height,
    pub total_voting_power: u64,
    pub proposer: Option<String>,
    pub validators: Vec<ValidatorInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitResponse {
    pub height: Height,
    pub round: Round,
    pub block_hash: Option<String>,
    pub signers: usize,
    pub aggregated: bool,
    pub commit: Commit,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TxSubmitResponse {
    pub hash: String,
    pub status: String,
}

// Request types

#[derive(Debug, Serialize, Deserialize)]
pub struct TxSubmitRequest {
    /// Hex-encoded transaction bytes
    pub tx: String,
}

// Handlers

/// GET /health - Engine lifecycle status
pub async fn get_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<EngineStatus>) {
    let status = state.consensus.status();
    let code = match status {
        EngineStatus::Halted(_) | EngineStatus::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(status))
}

/// GET /status - Get node status
pub async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, RpcError> {
    let summary = query_round_state(&state.consensus)?;
    let chain = state.consensus.get_state();

    Ok(Json(StatusResponse {
        chain_id: chain.chain_id,
        node_id: state.consensus.our_id().to_string(),
        engine: state.consensus.status(),
        latest_block_height: chain.last_block_height,
        latest_block_hash: chain.last_block_id.hash.map(|h| h.to_hex()),
        latest_block_time: chain.last_block_time,
        app_hash: chain.app_hash.to_hex(),
        height: summary.height,
        round: summary.round,
        step: summary.step.to_string(),
        pending_txs: state.mempool.as_ref().map(|pool| pool.pending()),
    }))
}

/// GET /round_state - Full view of the current height
pub async fn get_round_state(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RoundStateSummary>, RpcError> {
    Ok(Json(query_round_state(&state.consensus)?))
}

/// GET /validators - Validators of the height in progress
pub async fn get_validators(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ValidatorsResponse>, RpcError> {
    let (height, validators) = state.consensus.get_validators();

    Ok(Json(ValidatorsResponse {
        height,
        total_voting_power: validators.total_voting_power(),
        proposer: validators.proposer().map(|v| v.address.to_hex()),
        validators: validators
            .validators()
            .iter()
            .map(|v| ValidatorInfo {
                address: v.address.to_hex(),
                pub_key: v.pub_key.to_hex(),
                voting_power: v.voting_power,
                accum: v.accum,
            })
            .collect(),
    }))
}

/// GET /commit/{height} - Commit that finalized a height
pub async fn get_commit(
    State(state): State<Arc<AppState>>,
    Path(height): Path<Height>,
) -> Result<Json<CommitResponse>, RpcError> {
    let commit = state
        .consensus
        .load_commit(height)
        .ok_or_else(|| RpcError::NotFound(format!("No commit for height {}", height)))?;

    Ok(Json(CommitResponse {
        height: commit.height,
        round: commit.round,
        block_hash: commit.block_id.hash.map(|h| h.to_hex()),
        signers: commit.bit_array().count_ones(),
        aggregated: commit.aggregate.is_some(),
        commit,
    }))
}

/// POST /tx - Submit a transaction
pub async fn submit_tx(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TxSubmitRequest>,
) -> Result<Json<TxSubmitResponse>, RpcError> {
    let mempool = state
        .mempool
        .as_ref()
        .ok_or_else(|| RpcError::BadRequest("Node does not accept transactions".to_string()))?;

    let tx = hex::decode(request.tx.trim_start_matches("0x"))
        .map_err(|e| RpcError::BadRequest(format!("Invalid transaction hex: {}", e)))?;
    if tx.is_empty() {
        return Err(RpcError::BadRequest("Empty transaction".to_string()));
    }

    let hash = tx_hash(&tx);
    mempool.submit_tx(tx).map_err(RpcError::BadRequest)?;
    state.consensus.notify_txs_available();

    info!("Accepted transaction {}", hash);
    Ok(Json(TxSubmitResponse {
        hash: hash.to_hex(),
        status: "pending".to_string(),
    }))
}

/// POST /consensus/message - Deliver a message from a peer
pub async fn receive_consensus_message(
    State(state): State<Arc<AppState>>,
    Json(mi): Json<MsgInfo>,
) -> Result<StatusCode, RpcError> {
    debug!("{} from {}", mi.msg.kind(), mi.peer_id);
    state.consensus.send_peer_message(mi)?;
    Ok(StatusCode::ACCEPTED)
}

fn query_round_state(consensus: &ConsensusHandle) -> Result<RoundStateSummary, RpcError> {
    consensus
        .query_round_state()
        .ok_or_else(|| RpcError::Unavailable("Consensus engine is busy".to_string()))
}
