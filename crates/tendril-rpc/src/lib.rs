//! Tendril RPC - HTTP API
//!
//! Read-only views of the consensus engine, transaction intake and an
//! ingress endpoint for consensus messages sent by peers.

pub mod error;
pub mod http;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tendril_consensus::ConsensusHandle;
use tendril_core::Tx;
use tracing::info;

use http::{create_router, AppState};

pub use error::RpcError;
pub use http::handlers::{
    CommitResponse, StatusResponse, TxSubmitRequest, TxSubmitResponse, ValidatorInfo,
    ValidatorsResponse,
};

/// Destination for transactions submitted over RPC.
pub trait TxSink: Send + Sync {
    fn submit_tx(&self, tx: Tx) -> Result<(), String>;

    /// Transactions waiting for a block.
    fn pending(&self) -> usize;
}

/// RPC server configuration
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// HTTP bind address
    pub http_addr: SocketAddr,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 26657)),
        }
    }
}

/// RPC server
pub struct RpcServer {
    config: RpcConfig,
    app_state: Arc<AppState>,
}

impl RpcServer {
    pub fn new(config: RpcConfig, consensus: ConsensusHandle) -> Self {
        RpcServer {
            config,
            app_state: Arc::new(AppState {
                consensus,
                mempool: None,
            }),
        }
    }

    /// Accept transactions into `mempool`.
    pub fn with_mempool(mut self, mempool: Arc<dyn TxSink>) -> Self {
        self.app_state = Arc::new(AppState {
            consensus: self.app_state.consensus.clone(),
            mempool: Some(mempool),
        });
        self
    }

    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.app_state))
    }

    /// Run the RPC server
    pub async fn run(self) -> Result<(), std::io::Error> {
        let router = self.router();
        let addr = self.config.http_addr;

        info!("Starting RPC server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await
    }
}
