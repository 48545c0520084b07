use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tendril_core::{BitArray, BlockId, Commit, Height, Round, ValidatorSet};
use tendril_state::{ConsensusStore, State};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ConsensusConfig;
use crate::error::ConsensusError;
use crate::executor::{BlockExecutor, ValidatorSource};
use crate::messages::{MsgInfo, PeerId};
use crate::round_state::RoundStateSummary;
use crate::signer::Signer;
use crate::state_machine::{outbound_channels, ConsensusState, NetworkOutbox};
use crate::strategy::ProposalStrategy;
use crate::timeout::{TimeoutInfo, TimeoutTicker};

const QUERY_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum EngineStatus {
    Starting,
    Running,
    Stopped,
    /// Stopped on a fatal error.
    Halted(String),
}

enum Event {
    Internal(MsgInfo),
    Peer(MsgInfo),
    Timeout(TimeoutInfo),
    TxsAvailable,
    Shutdown,
}

/// Single-consumer event loop around a [`ConsensusState`].
///
/// Internal messages, peer messages, timeouts and transaction notices are
/// handled one at a time; queries from a [`ConsensusHandle`] take the same
/// lock between events.
pub struct ConsensusEngine {
    cs: Arc<Mutex<ConsensusState>>,
    internal_rx: mpsc::Receiver<MsgInfo>,
    peer_rx: mpsc::Receiver<MsgInfo>,
    timeout_rx: mpsc::UnboundedReceiver<TimeoutInfo>,
    txs_rx: mpsc::UnboundedReceiver<()>,
    shutdown_rx: watch::Receiver<bool>,
    status_tx: Arc<watch::Sender<EngineStatus>>,
}

impl std::fmt::Debug for ConsensusEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusEngine").finish_non_exhaustive()
    }
}

pub struct EngineBuilder {
    config: ConsensusConfig,
    state: State,
    executor: Box<dyn BlockExecutor>,
    store: Box<dyn ConsensusStore>,
    signer: Option<Box<dyn Signer>>,
    validator_source: Option<Box<dyn ValidatorSource>>,
    strategy: Option<Box<dyn ProposalStrategy>>,
    our_id: Option<PeerId>,
}

impl EngineBuilder {
    pub fn signer(mut self, signer: impl Signer + 'static) -> Self {
        self.signer = Some(Box::new(signer));
        self
    }

    pub fn validator_source(mut self, source: impl ValidatorSource + 'static) -> Self {
        self.validator_source = Some(Box::new(source));
        self
    }

    pub fn strategy(mut self, strategy: impl ProposalStrategy + 'static) -> Self {
        self.strategy = Some(Box::new(strategy));
        self
    }

    /// Identity used as the sender of our own messages. Defaults to the
    /// signer's address.
    pub fn our_id(mut self, our_id: PeerId) -> Self {
        self.our_id = Some(our_id);
        self
    }

    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<(ConsensusEngine, ConsensusHandle, NetworkOutbox), ConsensusError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let (ticker, timeout_rx) = TimeoutTicker::new();
        let (outbound, internal_rx, outbox) = outbound_channels(config.internal_queue_size);
        let (peer_tx, peer_rx) = mpsc::channel(config.peer_queue_size);
        let (txs_tx, txs_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(EngineStatus::Starting);

        let mut cs = ConsensusState::new(
            Arc::clone(&config),
            self.state,
            self.executor,
            self.store,
            Arc::new(ticker),
            outbound,
        )?;
        if let Some(our_id) = self.our_id {
            cs = cs.with_our_id(our_id);
        }
        if let Some(signer) = self.signer {
            cs = cs.with_signer(signer);
        }
        if let Some(source) = self.validator_source {
            cs = cs.with_validator_source(source);
        }
        if let Some(strategy) = self.strategy {
            cs = cs.with_strategy(strategy);
        }

        let gossip_votes = cs.gossip_votes_flag();
        let our_id = cs.our_id().clone();
        let cs = Arc::new(Mutex::new(cs));
        let status_tx = Arc::new(status_tx);

        let engine = ConsensusEngine {
            cs: Arc::clone(&cs),
            internal_rx,
            peer_rx,
            timeout_rx,
            txs_rx,
            shutdown_rx,
            status_tx,
        };
        let handle = ConsensusHandle {
            cs,
            our_id,
            peer_tx,
            txs_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            status_rx,
            gossip_votes,
        };
        Ok((engine, handle, outbox))
    }
}

impl ConsensusEngine {
    pub fn builder(
        config: ConsensusConfig,
        state: State,
        executor: impl BlockExecutor + 'static,
        store: impl ConsensusStore + 'static,
    ) -> EngineBuilder {
        EngineBuilder {
            config,
            state,
            executor: Box::new(executor),
            store: Box::new(store),
            signer: None,
            validator_source: None,
            strategy: None,
            our_id: None,
        }
    }

    /// Runs until stopped through a handle or halted by a fatal error.
    pub async fn run(mut self) -> Result<(), ConsensusError> {
        self.cs.lock().start();
        self.status_tx.send_replace(EngineStatus::Running);
        info!("Consensus engine running");

        loop {
            let event = tokio::select! {
                _ = self.shutdown_rx.changed() => Event::Shutdown,
                Some(mi) = self.internal_rx.recv() => Event::Internal(mi),
                Some(mi) = self.peer_rx.recv() => Event::Peer(mi),
                Some(ti) = self.timeout_rx.recv() => Event::Timeout(ti),
                Some(()) = self.txs_rx.recv() => Event::TxsAvailable,
                else => Event::Shutdown,
            };

            let result = {
                let mut cs = self.cs.lock();
                match event {
                    Event::Internal(mi) | Event::Peer(mi) => {
                        let peer = mi.peer_id.clone();
                        cs.handle_msg(mi).map_err(|e| (Some(peer), e))
                    }
                    Event::Timeout(ti) => cs.handle_timeout(ti).map_err(|e| (None, e)),
                    Event::TxsAvailable => cs.handle_txs_available().map_err(|e| (None, e)),
                    Event::Shutdown => {
                        info!("Consensus engine stopping");
                        self.status_tx.send_replace(EngineStatus::Stopped);
                        return Ok(());
                    }
                }
            };

            match result {
                Ok(()) => {}
                Err((_, e)) if e.is_fatal() => {
                    error!("Consensus halted: {}", e);
                    self.status_tx.send_replace(EngineStatus::Halted(e.to_string()));
                    return Err(e);
                }
                Err((Some(peer), e)) if e.is_peer_fault() => {
                    warn!("Rejected message from {}: {}", peer, e);
                }
                Err((_, e)) => debug!("Event not applied: {}", e),
            }
        }
    }
}

/// Cloneable access to a running engine.
#[derive(Clone)]
pub struct ConsensusHandle {
    cs: Arc<Mutex<ConsensusState>>,
    our_id: PeerId,
    peer_tx: mpsc::Sender<MsgInfo>,
    txs_tx: mpsc::UnboundedSender<()>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    status_rx: watch::Receiver<EngineStatus>,
    gossip_votes: Arc<AtomicBool>,
}

impl std::fmt::Debug for ConsensusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusHandle")
            .field("our_id", &self.our_id)
            .finish_non_exhaustive()
    }
}

impl ConsensusHandle {
    pub fn our_id(&self) -> &PeerId {
        &self.our_id
    }

    pub fn get_round_state(&self) -> RoundStateSummary {
        self.cs.lock().round_state().summary()
    }

    /// Like [`Self::get_round_state`], but gives up if the engine is busy.
    pub fn query_round_state(&self) -> Option<RoundStateSummary> {
        self.cs
            .try_lock_for(QUERY_LOCK_TIMEOUT)
            .map(|cs| cs.round_state().summary())
    }

    pub fn get_state(&self) -> State {
        self.cs.lock().state().clone()
    }

    pub fn get_validators(&self) -> (Height, ValidatorSet) {
        let cs = self.cs.lock();
        let (height, validators) = cs.validators();
        (height, validators.clone())
    }

    pub fn load_commit(&self, height: Height) -> Option<Commit> {
        self.cs.lock().load_commit(height)
    }

    pub fn get_prevotes_state(
        &self,
        height: Height,
        round: Round,
        block_id: &BlockId,
    ) -> Option<BitArray> {
        self.cs.lock().get_prevotes_state(height, round, block_id)
    }

    pub fn get_precommits_state(
        &self,
        height: Height,
        round: Round,
        block_id: &BlockId,
    ) -> Option<BitArray> {
        self.cs.lock().get_precommits_state(height, round, block_id)
    }

    /// Queues a message from a peer without waiting.
    pub fn send_peer_message(&self, mi: MsgInfo) -> Result<(), ConsensusError> {
        self.peer_tx.try_send(mi).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConsensusError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConsensusError::EngineStopped,
        })
    }

    pub fn notify_txs_available(&self) {
        if self.txs_tx.send(()).is_err() {
            debug!("Engine stopped, dropping txs notification");
        }
    }

    /// Whether individual votes should currently be gossiped to all peers.
    pub fn gossip_votes(&self) -> bool {
        self.gossip_votes.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> EngineStatus {
        self.status_rx.borrow().clone()
    }

    /// Resolves once the engine has stopped or halted.
    pub async fn stopped(&self) -> EngineStatus {
        let mut rx = self.status_rx.clone();
        loop {
            let status = rx.borrow_and_update().clone();
            if matches!(status, EngineStatus::Stopped | EngineStatus::Halted(_)) {
                return status;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }
}
