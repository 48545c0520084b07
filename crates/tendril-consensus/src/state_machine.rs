use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tendril_core::{
    now_millis, Address, BitArray, Block, BlockId, Commit, Heartbeat, Height, Proposal, Round, Sig,
    ValidatorSet, Vote, VoteType,
};
use tendril_state::{ConsensusStore, State};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ConsensusConfig;
use crate::error::{ConsensusError, FatalConsensusError, VoteError};
use crate::executor::{BlockExecutor, ValidatorSource};
use crate::height_vote_set::validators_for_round;
use crate::messages::{
    ConsensusMessage, HasVoteMsg, MsgInfo, PeerId, ValidBlockMsg, VoteSetBitsMsg, VoteSetMaj23Msg,
};
use crate::round_state::{RoundState, RoundStep};
use crate::signer::Signer;
use crate::strategy::{DefaultStrategy, ProposalStrategy};
use crate::timeout::{TimeoutInfo, TimeoutScheduler};
use crate::vote_set::VoteSet;

/// Sending side of the engine's queues.
#[derive(Debug, Clone)]
pub struct Outbound {
    internal: mpsc::Sender<MsgInfo>,
    broadcast: mpsc::UnboundedSender<MsgInfo>,
    unicast: mpsc::UnboundedSender<MsgInfo>,
}

/// Messages the engine wants on the network. Broadcast entries carry the
/// sender as `peer_id`, unicast entries the destination.
#[derive(Debug)]
pub struct NetworkOutbox {
    pub broadcast: mpsc::UnboundedReceiver<MsgInfo>,
    pub unicast: mpsc::UnboundedReceiver<MsgInfo>,
}

/// Creates the outbound channels and the receiver of the internal queue.
pub fn outbound_channels(
    internal_queue_size: usize,
) -> (Outbound, mpsc::Receiver<MsgInfo>, NetworkOutbox) {
    let (internal, internal_rx) = mpsc::channel(internal_queue_size.max(1));
    let (broadcast, broadcast_rx) = mpsc::unbounded_channel();
    let (unicast, unicast_rx) = mpsc::unbounded_channel();
    (
        Outbound {
            internal,
            broadcast,
            unicast,
        },
        internal_rx,
        NetworkOutbox {
            broadcast: broadcast_rx,
            unicast: unicast_rx,
        },
    )
}

/// The round-based consensus state machine for one validator (or observer).
///
/// Every handler runs to completion without awaiting. Our own proposals and
/// votes go through the internal queue and come back through
/// [`ConsensusState::handle_msg`] like any peer message.
pub struct ConsensusState {
    config: Arc<ConsensusConfig>,
    state: State,
    rs: RoundState,
    signer: Option<Box<dyn Signer>>,
    executor: Box<dyn BlockExecutor>,
    store: Box<dyn ConsensusStore>,
    validator_source: Option<Box<dyn ValidatorSource>>,
    strategy: Box<dyn ProposalStrategy>,
    timeouts: Arc<dyn TimeoutScheduler>,
    outbound: Outbound,
    our_id: PeerId,
    gossip_votes: Arc<AtomicBool>,
    heartbeat_seq: u64,
}

impl ConsensusState {
    pub fn new(
        config: Arc<ConsensusConfig>,
        state: State,
        executor: Box<dyn BlockExecutor>,
        store: Box<dyn ConsensusStore>,
        timeouts: Arc<dyn TimeoutScheduler>,
        outbound: Outbound,
    ) -> Result<Self, FatalConsensusError> {
        let last_commit = reconstruct_last_commit(store.as_ref(), &state)?;
        let start_time = config.commit(Instant::now());
        let rs = RoundState::new(&state, start_time, last_commit);

        Ok(ConsensusState {
            config,
            state,
            rs,
            signer: None,
            executor,
            store,
            validator_source: None,
            strategy: Box::new(DefaultStrategy),
            timeouts,
            outbound,
            our_id: PeerId::default(),
            gossip_votes: Arc::new(AtomicBool::new(false)),
            heartbeat_seq: 0,
        })
    }

    pub fn with_signer(mut self, signer: Box<dyn Signer>) -> Self {
        if self.our_id == PeerId::default() {
            self.our_id = PeerId::from(signer.address());
        }
        self.signer = Some(signer);
        self
    }

    pub fn with_strategy(mut self, strategy: Box<dyn ProposalStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_validator_source(mut self, source: Box<dyn ValidatorSource>) -> Self {
        self.validator_source = Some(source);
        self
    }

    pub fn with_our_id(mut self, our_id: PeerId) -> Self {
        self.our_id = our_id;
        self
    }

    /// Schedules round 0 of the current height.
    pub fn start(&mut self) {
        info!(
            "Starting consensus at height {} as {}",
            self.rs.height,
            if self.signer.is_some() { "validator" } else { "observer" }
        );
        self.schedule_round0();
    }

    // ---- accessors ----

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn validators(&self) -> (Height, &ValidatorSet) {
        (self.rs.height, &self.rs.validators)
    }

    pub fn our_id(&self) -> &PeerId {
        &self.our_id
    }

    pub fn gossip_votes_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.gossip_votes)
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Stored commit for `height`; storage errors read as a missing commit.
    pub fn load_commit(&self, height: Height) -> Option<Commit> {
        match self.store.load_seen_commit(height) {
            Ok(commit) => commit,
            Err(e) => {
                warn!("Failed to load commit for height {}: {}", height, e);
                None
            }
        }
    }

    pub fn get_prevotes_state(
        &self,
        height: Height,
        round: Round,
        block_id: &BlockId,
    ) -> Option<BitArray> {
        if height != self.rs.height {
            return None;
        }
        self.rs.votes.prevotes(round)?.bit_array_by_block_id(block_id)
    }

    pub fn get_precommits_state(
        &self,
        height: Height,
        round: Round,
        block_id: &BlockId,
    ) -> Option<BitArray> {
        if height != self.rs.height {
            return None;
        }
        self.rs.votes.precommits(round)?.bit_array_by_block_id(block_id)
    }

    fn our_address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }

    fn is_proposer(&self) -> bool {
        self.our_address()
            .is_some_and(|address| self.rs.validators.is_proposer(&address))
    }

    // ---- outbound ----

    fn send_internal(&self, msg: ConsensusMessage) {
        let mi = MsgInfo::new(msg, self.our_id.clone());
        match self.outbound.internal.try_send(mi) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(mi)) => {
                info!("Internal msg queue is full, spilling {} to a task", mi.msg.kind());
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let tx = self.outbound.internal.clone();
                        handle.spawn(async move {
                            let _ = tx.send(mi).await;
                        });
                    }
                    Err(_) => warn!("No runtime to spill {}, dropping it", mi.msg.kind()),
                }
            }
            Err(mpsc::error::TrySendError::Closed(mi)) => {
                debug!("Internal queue closed, dropping {}", mi.msg.kind());
            }
        }
    }

    fn broadcast(&self, msg: ConsensusMessage) {
        if let Err(e) = self
            .outbound
            .broadcast
            .send(MsgInfo::new(msg, self.our_id.clone()))
        {
            debug!("Broadcast channel closed, dropping {}", e.0.msg.kind());
        }
    }

    fn unicast(&self, msg: ConsensusMessage, to: PeerId) {
        if let Err(e) = self.outbound.unicast.send(MsgInfo::new(msg, to)) {
            debug!("Unicast channel closed, dropping {}", e.0.msg.kind());
        }
    }

    fn new_step(&self) {
        self.broadcast(ConsensusMessage::NewRoundStep(self.rs.new_round_step_msg()));
    }

    fn schedule_timeout(&self, duration: Duration, height: Height, round: Round, step: RoundStep) {
        self.timeouts.schedule_timeout(TimeoutInfo {
            duration,
            height,
            round,
            step,
        });
    }

    fn schedule_round0(&self) {
        let duration = self.rs.start_time.saturating_duration_since(Instant::now());
        self.schedule_timeout(duration, self.rs.height, 0, RoundStep::NewHeight);
    }

    // ---- event entry points ----

    pub fn handle_msg(&mut self, mi: MsgInfo) -> Result<(), ConsensusError> {
        let MsgInfo { msg, peer_id } = mi;
        match msg {
            ConsensusMessage::Proposal(proposal) => self.set_proposal(proposal),
            ConsensusMessage::ProposalBlock(block) => self.add_proposal_block(*block),
            ConsensusMessage::Vote(vote) => self.try_add_vote(vote, &peer_id),
            ConsensusMessage::AggregateVote(agg) => self.try_add_aggregate_vote(agg, &peer_id),
            ConsensusMessage::VoteSetMaj23(msg) => self.handle_vote_set_maj23(msg, peer_id),
            msg @ (ConsensusMessage::NewRoundStep(_)
            | ConsensusMessage::ValidBlock(_)
            | ConsensusMessage::HasVote(_)
            | ConsensusMessage::ProposalPol(_)
            | ConsensusMessage::VoteSetBits(_)
            | ConsensusMessage::Heartbeat(_)) => {
                debug!("Ignoring {} from {}", msg.kind(), peer_id);
                Ok(())
            }
        }
    }

    pub fn handle_timeout(&mut self, ti: TimeoutInfo) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if ti.height != rs.height || ti.round < rs.round || (ti.round == rs.round && ti.step < rs.step)
        {
            debug!(
                "Ignoring timeout {}/{}/{}, we are at {}/{}/{}",
                ti.height, ti.round, ti.step, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        debug!("Timeout {}/{}/{}", ti.height, ti.round, ti.step);

        match ti.step {
            RoundStep::NewHeight => self.enter_new_round(ti.height, ti.round)?,
            RoundStep::NewRound => {
                if self.rs.step == RoundStep::NewHeight || self.rs.round < ti.round {
                    self.enter_new_round(ti.height, ti.round)?;
                }
                self.enter_propose(ti.height, ti.round)?;
            }
            RoundStep::Propose => self.enter_prevote(ti.height, ti.round)?,
            RoundStep::PrevoteWait => self.enter_precommit(ti.height, ti.round)?,
            RoundStep::PrecommitWait => {
                self.enter_precommit(ti.height, ti.round)?;
                self.enter_new_round(ti.height, ti.round + 1)?;
            }
            RoundStep::AggPrevoteWait => self.enter_agg_prevote_wait(ti.height, ti.round)?,
            RoundStep::AggPrecommitWait => self.enter_agg_precommit_wait(ti.height, ti.round)?,
            step @ (RoundStep::Prevote | RoundStep::Precommit | RoundStep::Commit) => {
                return Err(FatalConsensusError::InvalidTimeoutStep(step).into());
            }
        }
        Ok(())
    }

    /// The executor has transactions for the current height.
    pub fn handle_txs_available(&mut self) -> Result<(), ConsensusError> {
        if self.rs.round != 0 {
            return Ok(());
        }
        match self.rs.step {
            RoundStep::NewHeight => {
                // Lands just after the round 0 timeout.
                let duration = self.rs.start_time.saturating_duration_since(Instant::now())
                    + Duration::from_millis(1);
                self.schedule_timeout(duration, self.rs.height, 0, RoundStep::NewRound);
            }
            RoundStep::NewRound => self.enter_propose(self.rs.height, 0)?,
            _ => {}
        }
        Ok(())
    }

    fn handle_vote_set_maj23(
        &mut self,
        msg: VoteSetMaj23Msg,
        peer: PeerId,
    ) -> Result<(), ConsensusError> {
        if msg.height != self.rs.height {
            debug!("Ignoring VoteSetMaj23 for height {} from {}", msg.height, peer);
            return Ok(());
        }
        self.rs
            .votes
            .set_peer_maj23(msg.round, msg.vote_type, peer.clone(), msg.block_id)?;

        let votes = match msg.vote_type {
            VoteType::Prevote => self.get_prevotes_state(msg.height, msg.round, &msg.block_id),
            VoteType::Precommit => self.get_precommits_state(msg.height, msg.round, &msg.block_id),
        }
        .unwrap_or_else(|| BitArray::new(self.rs.validators.len()));

        self.unicast(
            ConsensusMessage::VoteSetBits(VoteSetBitsMsg {
                height: msg.height,
                round: msg.round,
                vote_type: msg.vote_type,
                block_id: msg.block_id,
                votes,
            }),
            peer,
        );
        Ok(())
    }

    // ---- state transitions ----

    fn enter_new_round(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && rs.step != RoundStep::NewHeight)
        {
            debug!(
                "enter_new_round({}/{}): invalid args, at {}/{}/{}",
                height, round, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        info!("enter_new_round({}/{}), at {}/{}/{}", height, round, rs.height, rs.round, rs.step);

        self.gossip_votes.store(false, Ordering::SeqCst);
        let validators = self.rs.votes.round_validators(round);
        self.rs.round = round;
        self.rs.step = RoundStep::NewRound;
        self.rs.validators = validators;
        if round != 0 {
            debug!("Resetting proposal info");
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_hash = None;
        }
        self.rs.votes.set_round(round + 1);
        self.new_step();

        let wait_for_txs =
            round == 0 && !self.config.create_empty_blocks && !self.executor.txs_available();
        if wait_for_txs {
            if let Some(interval) = self.config.empty_block_interval() {
                self.schedule_timeout(interval, height, round, RoundStep::NewRound);
            }
            self.send_heartbeat(height, round);
            Ok(())
        } else {
            self.enter_propose(height, round)
        }
    }

    fn send_heartbeat(&mut self, height: Height, round: Round) {
        let Some(signer) = self.signer.as_mut() else {
            return;
        };
        let address = signer.address();
        let Some((index, _)) = self.rs.validators.get_by_address(&address) else {
            return;
        };
        let mut heartbeat = Heartbeat {
            validator_address: address,
            validator_index: index,
            height,
            round,
            sequence: self.heartbeat_seq,
            signature: Sig::default(),
        };
        if let Err(e) = signer.sign_heartbeat(&self.state.chain_id, &mut heartbeat) {
            error!("Failed to sign heartbeat: {}", e);
            return;
        }
        self.heartbeat_seq += 1;
        debug!("Waiting for txs at {}/{}, sending heartbeat", height, round);
        self.broadcast(ConsensusMessage::Heartbeat(heartbeat));
        self.new_step();
    }

    fn enter_propose(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStep::Propose <= rs.step)
        {
            debug!(
                "enter_propose({}/{}): invalid args, at {}/{}/{}",
                height, round, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        info!("enter_propose({}/{}), at {}/{}/{}", height, round, rs.height, rs.round, rs.step);

        self.schedule_timeout(self.config.propose(round), height, round, RoundStep::Propose);

        match self.our_address() {
            Some(address) if self.rs.validators.has_address(&address) => {
                if self.is_proposer() {
                    info!("Our turn to propose at {}/{}", height, round);
                    self.decide_proposal(height, round);
                } else {
                    debug!(
                        "Not our turn to propose at {}/{}, proposer {:?}",
                        height,
                        round,
                        self.rs.proposer()
                    );
                }
            }
            _ => debug!("This node is not a validator"),
        }

        self.rs.round = round;
        self.rs.step = RoundStep::Propose;
        self.new_step();

        if self.rs.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round)?;
        }
        Ok(())
    }

    fn decide_proposal(&mut self, height: Height, round: Round) {
        let Some(address) = self.our_address() else {
            return;
        };
        let block = match self.strategy.decide_proposal(
            &self.rs,
            &self.state,
            self.executor.as_mut(),
            address,
        ) {
            Ok(Some(block)) => block,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to create proposal block at {}/{}: {}", height, round, e);
                return;
            }
        };

        let pol_block_id = match self.rs.valid_round {
            Some(_) => block.id(),
            None => BlockId::NIL,
        };
        let mut proposal =
            Proposal::new(height, round, block.hash(), self.rs.valid_round, pol_block_id);
        let Some(signer) = self.signer.as_mut() else {
            return;
        };
        if let Err(e) = signer.sign_proposal(&self.state.chain_id, &mut proposal) {
            error!("Failed to sign proposal at {}/{}: {}", height, round, e);
            return;
        }

        info!("Signed {}", proposal);
        self.send_internal(ConsensusMessage::Proposal(proposal.clone()));
        self.send_internal(ConsensusMessage::ProposalBlock(Box::new(block.clone())));
        self.broadcast(ConsensusMessage::Proposal(proposal));
        self.broadcast(ConsensusMessage::ProposalBlock(Box::new(block)));
    }

    fn enter_prevote(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStep::Prevote <= rs.step)
        {
            debug!(
                "enter_prevote({}/{}): invalid args, at {}/{}/{}",
                height, round, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        info!("enter_prevote({}/{}), at {}/{}/{}", height, round, rs.height, rs.round, rs.step);

        let block_id = self
            .strategy
            .decide_prevote(&self.rs, &self.state, self.executor.as_ref());
        self.sign_add_vote(VoteType::Prevote, round, block_id);

        self.rs.round = round;
        self.rs.step = RoundStep::Prevote;
        self.new_step();
        Ok(())
    }

    fn enter_agg_prevote_wait(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStep::AggPrevoteWait <= rs.step)
        {
            debug!(
                "enter_agg_prevote_wait({}/{}): invalid args, at {}/{}/{}",
                height, round, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        info!("enter_agg_prevote_wait({}/{}): no aggregate yet, gossiping votes", height, round);

        self.enable_gossip(round, VoteType::Prevote);
        self.rs.round = round;
        self.rs.step = RoundStep::AggPrevoteWait;
        self.new_step();
        Ok(())
    }

    fn enter_prevote_wait(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStep::PrevoteWait <= rs.step)
        {
            debug!(
                "enter_prevote_wait({}/{}): invalid args, at {}/{}/{}",
                height, round, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        let prevotes = self.rs.votes.prevotes(round);
        if !prevotes.is_some_and(VoteSet::has_two_thirds_any) {
            return Err(FatalConsensusError::MissingQuorum {
                height,
                round,
                step: RoundStep::PrevoteWait,
            }
            .into());
        }
        info!("enter_prevote_wait({}/{}), at {}/{}/{}", height, round, rs.height, rs.round, rs.step);

        let has_aggregate = prevotes.is_some_and(|p| p.aggregate().is_some());
        if self.config.use_aggregate_signature && !self.is_proposer() && !has_aggregate {
            self.enable_gossip(round, VoteType::Prevote);
        }
        self.schedule_timeout(self.config.prevote(round), height, round, RoundStep::PrevoteWait);

        self.rs.round = round;
        self.rs.step = RoundStep::PrevoteWait;
        self.new_step();
        Ok(())
    }

    /// Locks and precommits a block with a polka this round, unlocks and
    /// precommits nil on a nil polka, and precommits nil otherwise.
    fn enter_precommit(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStep::Precommit <= rs.step)
        {
            debug!(
                "enter_precommit({}/{}): invalid args, at {}/{}/{}",
                height, round, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        info!("enter_precommit({}/{}), at {}/{}/{}", height, round, rs.height, rs.round, rs.step);

        let polka = self
            .rs
            .votes
            .prevotes(round)
            .and_then(VoteSet::two_thirds_majority);
        let precommit_for = match polka {
            None => {
                if self.rs.locked_block.is_some() {
                    info!("No +2/3 prevotes at {}/{} while locked, precommitting nil", height, round);
                } else {
                    info!("No +2/3 prevotes at {}/{}, precommitting nil", height, round);
                }
                BlockId::NIL
            }
            Some(block_id) => self.precommit_on_polka(height, round, block_id)?,
        };
        self.sign_add_vote(VoteType::Precommit, round, precommit_for);

        self.rs.round = round;
        self.rs.step = RoundStep::Precommit;
        self.new_step();
        Ok(())
    }

    fn precommit_on_polka(
        &mut self,
        height: Height,
        round: Round,
        block_id: BlockId,
    ) -> Result<BlockId, ConsensusError> {
        let Some(hash) = block_id.hash else {
            if self.rs.locked_block.is_some() {
                info!("+2/3 prevoted nil at {}/{}, unlocking", height, round);
            } else {
                info!("+2/3 prevoted nil at {}/{}", height, round);
            }
            self.rs.locked_round = None;
            self.rs.locked_block = None;
            return Ok(BlockId::NIL);
        };

        let pol_round = self.rs.votes.pol_info().map(|(r, _)| r);
        if pol_round.map_or(true, |r| r < round) {
            return Err(FatalConsensusError::PolRoundMismatch {
                expected: round,
                got: pol_round,
            }
            .into());
        }

        if self.rs.locked_block.as_ref().is_some_and(|b| b.hashes_to(&hash)) {
            info!("+2/3 prevoted locked block {}, relocking", hash.short());
            self.rs.locked_round = Some(round);
            return Ok(block_id);
        }

        if let Some(block) = self.rs.proposal_block.as_ref().filter(|b| b.hashes_to(&hash)) {
            info!("+2/3 prevoted proposal block {}, locking", hash.short());
            self.executor
                .validate_block(&self.state, block)
                .map_err(|e| FatalConsensusError::InvalidPolkaBlock(e.to_string()))?;
            self.rs.locked_round = Some(round);
            self.rs.locked_block = Some(block.clone());
            return Ok(block_id);
        }

        info!("+2/3 prevotes for unknown block {}, precommitting nil", hash.short());
        self.rs.locked_round = None;
        self.rs.locked_block = None;
        if self.rs.proposal_block_hash != Some(hash) {
            self.rs.proposal_block = None;
            self.rs.proposal_block_hash = Some(hash);
        }
        Ok(BlockId::NIL)
    }

    fn enter_agg_precommit_wait(
        &mut self,
        height: Height,
        round: Round,
    ) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStep::AggPrecommitWait <= rs.step)
        {
            debug!(
                "enter_agg_precommit_wait({}/{}): invalid args, at {}/{}/{}",
                height, round, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        info!("enter_agg_precommit_wait({}/{}): no aggregate yet, gossiping votes", height, round);

        self.enable_gossip(round, VoteType::Precommit);
        self.rs.round = round;
        self.rs.step = RoundStep::AggPrecommitWait;
        self.new_step();
        Ok(())
    }

    fn enter_precommit_wait(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStep::PrecommitWait <= rs.step)
        {
            debug!(
                "enter_precommit_wait({}/{}): invalid args, at {}/{}/{}",
                height, round, rs.height, rs.round, rs.step
            );
            return Ok(());
        }
        let precommits = self.rs.votes.precommits(round);
        if !precommits.is_some_and(VoteSet::has_two_thirds_any) {
            return Err(FatalConsensusError::MissingQuorum {
                height,
                round,
                step: RoundStep::PrecommitWait,
            }
            .into());
        }
        info!("enter_precommit_wait({}/{}), at {}/{}/{}", height, round, rs.height, rs.round, rs.step);

        let has_aggregate = precommits.is_some_and(|p| p.aggregate().is_some());
        if self.config.use_aggregate_signature && !self.is_proposer() && !has_aggregate {
            self.enable_gossip(round, VoteType::Precommit);
        }
        self.schedule_timeout(
            self.config.precommit(round),
            height,
            round,
            RoundStep::PrecommitWait,
        );

        self.rs.round = round;
        self.rs.step = RoundStep::PrecommitWait;
        self.new_step();
        Ok(())
    }

    fn enter_commit(&mut self, height: Height, commit_round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height || RoundStep::Commit <= self.rs.step {
            debug!(
                "enter_commit({}/{}): invalid args, at {}/{}/{}",
                height, commit_round, self.rs.height, self.rs.round, self.rs.step
            );
            return Ok(());
        }
        info!(
            "enter_commit({}/{}), at {}/{}/{}",
            height, commit_round, self.rs.height, self.rs.round, self.rs.step
        );

        let block_id = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(VoteSet::two_thirds_majority)
            .ok_or(FatalConsensusError::MissingQuorum {
                height,
                round: commit_round,
                step: RoundStep::Commit,
            })?;
        let hash = block_id.hash.ok_or_else(|| {
            FatalConsensusError::UnexpectedState(format!("commit for nil at {height}/{commit_round}"))
        })?;

        if self.rs.locked_block.as_ref().is_some_and(|b| b.hashes_to(&hash)) {
            debug!("Commit is for the locked block {}", hash.short());
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_hash = Some(hash);
        }

        if !self.rs.proposal_block.as_ref().is_some_and(|b| b.hashes_to(&hash)) {
            info!("Commit is for unknown block {}, waiting for it", hash.short());
            self.rs.proposal_block = None;
            self.rs.proposal_block_hash = Some(hash);
            self.broadcast(ConsensusMessage::ValidBlock(ValidBlockMsg {
                height,
                round: self.rs.round,
                block_hash: hash,
                is_commit: true,
            }));
        }

        self.rs.step = RoundStep::Commit;
        self.rs.commit_round = Some(commit_round);
        self.rs.commit_time = Some(Instant::now());
        self.new_step();

        self.try_finalize_commit(height)
    }

    fn try_finalize_commit(&mut self, height: Height) -> Result<(), ConsensusError> {
        if self.rs.height != height {
            return Err(FatalConsensusError::UnexpectedState(format!(
                "finalize height {} at height {}",
                height, self.rs.height
            ))
            .into());
        }
        let block_id = self
            .rs
            .commit_round
            .and_then(|r| self.rs.votes.precommits(r))
            .and_then(VoteSet::two_thirds_majority);
        let Some(hash) = block_id.and_then(|id| id.hash) else {
            debug!("Cannot finalize {}: no +2/3 majority for a block", height);
            return Ok(());
        };
        if !self.rs.proposal_block.as_ref().is_some_and(|b| b.hashes_to(&hash)) {
            debug!("Cannot finalize {}: missing block {}", height, hash.short());
            return Ok(());
        }
        self.finalize_commit(height)
    }

    fn finalize_commit(&mut self, height: Height) -> Result<(), ConsensusError> {
        if self.rs.height != height || self.rs.step != RoundStep::Commit {
            debug!(
                "finalize_commit({}): invalid args, at {}/{}/{}",
                height, self.rs.height, self.rs.round, self.rs.step
            );
            return Ok(());
        }

        let commit_round = self.rs.commit_round.ok_or_else(|| {
            FatalConsensusError::UnexpectedState("commit step without commit round".into())
        })?;
        let precommits = self.rs.votes.precommits(commit_round).ok_or(
            FatalConsensusError::MissingQuorum {
                height,
                round: commit_round,
                step: RoundStep::Commit,
            },
        )?;
        let seen_commit = precommits
            .make_commit()
            .map_err(|e| FatalConsensusError::UnexpectedState(e.to_string()))?;
        let block = self
            .rs
            .proposal_block
            .clone()
            .ok_or_else(|| FatalConsensusError::UnexpectedState("no block to commit".into()))?;
        let block_id = block.id();
        if block_id != seen_commit.block_id {
            return Err(FatalConsensusError::UnexpectedState(format!(
                "block {} does not match commit {}",
                block_id, seen_commit.block_id
            ))
            .into());
        }

        self.executor
            .validate_block(&self.state, &block)
            .map_err(|e| FatalConsensusError::InvalidCommittedBlock(e.to_string()))?;
        let mut new_state = self
            .executor
            .apply_block(&self.state, block_id, &block)
            .map_err(|e| FatalConsensusError::ApplyBlock {
                height,
                reason: e.to_string(),
            })?;
        self.apply_validator_updates(height, &mut new_state);

        self.store
            .save_consensus_state(height, &new_state, &seen_commit)
            .map_err(|e| FatalConsensusError::Persist(e.to_string()))?;

        let ours = self.our_address() == Some(block.header.proposer_address);
        info!(
            "Finalized block {} at {}/{} with {} txs{}",
            block_id,
            height,
            commit_round,
            block.txs.len(),
            if ours { " (our proposal)" } else { "" }
        );

        self.update_to_state(new_state)?;
        self.schedule_round0();
        Ok(())
    }

    /// Changes decided at `height` apply to the validators of `height + 1`.
    fn apply_validator_updates(&self, height: Height, new_state: &mut State) {
        let Some(source) = &self.validator_source else {
            return;
        };
        let updates = match source.validator_updates(height) {
            Ok(updates) if updates.is_empty() => return,
            Ok(updates) => updates,
            Err(e) => {
                warn!("Failed to query validator updates at {}: {}", height, e);
                return;
            }
        };
        let mut next = new_state.validators.clone();
        match next.apply_updates(&updates) {
            Ok(()) => {
                info!("Validator set changes at height {}: {} updates", height + 1, updates.len());
                new_state.validators = next;
                new_state.last_height_validators_changed = height + 1;
            }
            Err(e) => error!("Rejected validator updates from height {}: {}", height, e),
        }
    }

    fn update_to_state(&mut self, state: State) -> Result<(), ConsensusError> {
        if state.last_block_height <= self.state.last_block_height {
            info!(
                "Ignoring state for height {}, already past {}",
                state.last_block_height + 1,
                self.state.last_block_height + 1
            );
            return Ok(());
        }

        let last_commit = match self.rs.commit_round {
            Some(round) => {
                let precommits = self
                    .rs
                    .votes
                    .precommits(round)
                    .filter(|p| p.has_two_thirds_majority())
                    .ok_or(FatalConsensusError::MissingQuorum {
                        height: self.rs.height,
                        round,
                        step: RoundStep::Commit,
                    })?;
                Some(precommits.clone())
            }
            None => None,
        };

        let start_time = self.config.commit(self.rs.commit_time.unwrap_or_else(Instant::now));
        self.gossip_votes.store(false, Ordering::SeqCst);
        self.rs = RoundState::new(&state, start_time, last_commit);
        self.state = state;
        self.new_step();
        Ok(())
    }

    // ---- proposals ----

    fn set_proposal(&mut self, proposal: Proposal) -> Result<(), ConsensusError> {
        if self.rs.proposal.is_some() {
            debug!("Already have a proposal for {}/{}", self.rs.height, self.rs.round);
            return Ok(());
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            debug!(
                "Ignoring {} at {}/{}",
                proposal, self.rs.height, self.rs.round
            );
            return Ok(());
        }
        self.strategy
            .verify_proposal(&proposal, &self.rs, &self.state.chain_id)?;

        info!("Received {} at step {}", proposal, self.rs.step);
        self.rs.proposal_block_hash = Some(proposal.block_hash);
        self.rs.proposal = Some(proposal);
        Ok(())
    }

    fn add_proposal_block(&mut self, block: Block) -> Result<(), ConsensusError> {
        let height = block.header.height;
        if height != self.rs.height {
            debug!("Received block for height {} at {}", height, self.rs.height);
            return Ok(());
        }
        let Some(expected) = self.rs.proposal_block_hash else {
            debug!("Received block {} without a proposal", block.hash().short());
            return Ok(());
        };
        if !block.hashes_to(&expected) {
            debug!("Received block {}, expecting {}", block.hash().short(), expected.short());
            return Ok(());
        }
        if self.rs.proposal_block.as_ref().is_some_and(|b| b.hashes_to(&expected)) {
            debug!("Already have block {}", expected.short());
            return Ok(());
        }

        info!("Received proposal block {} at {}/{}", expected.short(), self.rs.height, self.rs.round);
        self.rs.proposal_block = Some(block);

        let round = self.rs.round;
        let polka = self
            .rs
            .votes
            .prevotes(round)
            .and_then(VoteSet::two_thirds_majority);
        if let Some(hash) = polka.and_then(|id| id.hash) {
            if self.rs.valid_round.map_or(true, |vr| vr < round) && hash == expected {
                info!("Updating valid block to {} at round {}", expected.short(), round);
                self.rs.valid_round = Some(round);
                self.rs.valid_block = self.rs.proposal_block.clone();
            }
        }

        if self.rs.step <= RoundStep::Propose && self.rs.is_proposal_complete() {
            self.enter_prevote(height, round)?;
            if polka.is_some() {
                self.enter_precommit(height, round)?;
            }
        } else if self.rs.step == RoundStep::Commit {
            self.try_finalize_commit(height)?;
        }
        Ok(())
    }

    // ---- votes ----

    fn try_add_vote(&mut self, vote: Vote, peer: &PeerId) -> Result<(), ConsensusError> {
        let ours = self.our_address() == Some(vote.validator_address);
        let (height, round) = (vote.height, vote.round);
        match self.add_vote(vote, peer) {
            Ok(_) => Ok(()),
            Err(ConsensusError::Vote(VoteError::Conflicting(conflict))) if ours => {
                error!(
                    "Conflicting vote from our own key: {} vs {}",
                    conflict.existing, conflict.new
                );
                Err(FatalConsensusError::ConflictingOwnVote { height, round }.into())
            }
            Err(e) => Err(e),
        }
    }

    fn add_vote(&mut self, vote: Vote, peer: &PeerId) -> Result<bool, ConsensusError> {
        debug!("Received {} from {} at {}/{}/{}", vote, peer, self.rs.height, self.rs.round, self.rs.step);

        // Precommit stragglers for the previous height.
        if vote.height + 1 == self.rs.height {
            let mismatch = ConsensusError::HeightMismatch {
                expected: self.rs.height,
                got: vote.height,
            };
            if self.rs.step != RoundStep::NewHeight || vote.vote_type != VoteType::Precommit {
                return Err(mismatch);
            }
            let Some(last_commit) = self.rs.last_commit.as_mut() else {
                return Err(mismatch);
            };
            let has_vote = has_vote_msg(&vote);
            if !last_commit.add_vote(vote)? {
                return Ok(false);
            }
            let all = last_commit.has_all();
            info!("Added to last precommits: {}", last_commit);
            self.broadcast(ConsensusMessage::HasVote(has_vote));

            if self.config.skip_timeout_commit && all {
                self.enter_new_round(self.rs.height, 0)?;
            }
            return Ok(true);
        }

        if vote.height != self.rs.height {
            return Err(ConsensusError::HeightMismatch {
                expected: self.rs.height,
                got: vote.height,
            });
        }

        let height = self.rs.height;
        let (vote_type, round) = (vote.vote_type, vote.round);
        let has_vote = has_vote_msg(&vote);
        // A conflicting vote for a peer-claimed majority is still counted and
        // may complete a quorum, so react to it before reporting the conflict.
        let conflict = match self.rs.votes.add_vote(vote, peer) {
            Ok(false) => return Ok(false),
            Ok(true) => None,
            Err(VoteError::Conflicting(conflict)) if conflict.added => Some(conflict),
            Err(e) => return Err(e.into()),
        };
        self.broadcast(ConsensusMessage::HasVote(has_vote));

        match vote_type {
            VoteType::Prevote => self.on_prevote_added(height, round)?,
            VoteType::Precommit => self.on_precommit_added(height, round)?,
        }
        match conflict {
            Some(conflict) => Err(VoteError::Conflicting(conflict).into()),
            None => Ok(true),
        }
    }

    fn try_add_aggregate_vote(
        &mut self,
        agg: tendril_core::AggregateVote,
        peer: &PeerId,
    ) -> Result<(), ConsensusError> {
        if agg.height != self.rs.height {
            return Err(ConsensusError::HeightMismatch {
                expected: self.rs.height,
                got: agg.height,
            });
        }
        let height = self.rs.height;
        let (vote_type, round, block_id) = (agg.vote_type, agg.round, agg.block_id);
        if !self.rs.votes.add_aggregate_vote(agg, peer)? {
            return Ok(());
        }
        info!("Added aggregate {} for {} at {}/{} from {}", vote_type, block_id, height, round, peer);

        match vote_type {
            VoteType::Prevote => self.on_prevote_added(height, round),
            VoteType::Precommit => self.on_precommit_added(height, round),
        }
    }

    /// Reacts to new prevote power at `vote_round`, from a vote or an
    /// aggregate.
    fn on_prevote_added(&mut self, height: Height, vote_round: Round) -> Result<(), ConsensusError> {
        let Some(prevotes) = self.rs.votes.prevotes(vote_round) else {
            return Ok(());
        };
        let polka = prevotes.two_thirds_majority();
        let any = prevotes.has_two_thirds_any();
        debug!("Prevotes: {}", prevotes);

        if let Some(block_id) = polka {
            let unlock = match (self.rs.locked_round, &self.rs.locked_block) {
                (Some(locked_round), Some(locked)) => {
                    locked_round < vote_round
                        && vote_round <= self.rs.round
                        && block_id.hash != Some(locked.hash())
                }
                _ => false,
            };
            if unlock {
                info!(
                    "Unlocking because of POL at round {} (locked at {:?})",
                    vote_round, self.rs.locked_round
                );
                self.rs.locked_round = None;
                self.rs.locked_block = None;
            }

            if let Some(hash) = block_id.hash {
                if self.rs.valid_round.map_or(true, |vr| vr < vote_round)
                    && vote_round == self.rs.round
                {
                    if self.rs.proposal_block.as_ref().is_some_and(|b| b.hashes_to(&hash)) {
                        info!("Updating valid block to {} because of POL", hash.short());
                        self.rs.valid_round = Some(vote_round);
                        self.rs.valid_block = self.rs.proposal_block.clone();
                    } else {
                        info!("POL for unknown block {}, waiting for it", hash.short());
                        self.rs.proposal_block = None;
                    }
                    self.rs.proposal_block_hash = Some(hash);
                    self.broadcast(ConsensusMessage::ValidBlock(ValidBlockMsg {
                        height,
                        round: vote_round,
                        block_hash: hash,
                        is_commit: false,
                    }));
                }
            }
        }

        if self.rs.round < vote_round && any {
            // Round skip.
            self.enter_new_round(height, vote_round)?;
        } else if self.rs.round == vote_round {
            match polka {
                Some(block_id) => {
                    if RoundStep::Prevote <= self.rs.step
                        && (self.rs.is_proposal_complete() || block_id.is_nil())
                    {
                        self.maybe_aggregate(vote_round, VoteType::Prevote);
                        self.enter_precommit(height, vote_round)?;
                    }
                }
                None => {
                    if RoundStep::Prevote <= self.rs.step && any {
                        self.enter_prevote_wait(height, vote_round)?;
                    }
                }
            }
        } else if self.rs.proposal.as_ref().and_then(|p| p.pol_round) == Some(vote_round)
            && self.rs.is_proposal_complete()
        {
            self.enter_prevote(height, self.rs.round)?;
        }
        Ok(())
    }

    fn on_precommit_added(
        &mut self,
        height: Height,
        vote_round: Round,
    ) -> Result<(), ConsensusError> {
        let Some(precommits) = self.rs.votes.precommits(vote_round) else {
            return Ok(());
        };
        let majority = precommits.two_thirds_majority();
        let any = precommits.has_two_thirds_any();
        let all = precommits.has_all();
        debug!("Precommits: {}", precommits);

        match majority {
            Some(block_id) => {
                self.enter_new_round(height, vote_round)?;
                self.enter_precommit(height, vote_round)?;
                self.maybe_aggregate(vote_round, VoteType::Precommit);
                if block_id.is_nil() {
                    self.enter_precommit_wait(height, vote_round)?;
                } else {
                    self.enter_commit(height, vote_round)?;
                    if self.config.skip_timeout_commit && all {
                        self.enter_new_round(self.rs.height, 0)?;
                    }
                }
            }
            None if self.rs.round <= vote_round && any => {
                self.enter_new_round(height, vote_round)?;
                self.enter_precommit_wait(height, vote_round)?;
            }
            None => {}
        }
        Ok(())
    }

    /// As the round proposer in aggregate mode, turns a fresh majority into
    /// an aggregate vote and broadcasts it.
    fn maybe_aggregate(&mut self, round: Round, vote_type: VoteType) {
        if !self.config.use_aggregate_signature {
            return;
        }
        let Some(address) = self.our_address() else {
            return;
        };
        let set = match vote_type {
            VoteType::Prevote => self.rs.votes.prevotes_mut(round),
            VoteType::Precommit => self.rs.votes.precommits_mut(round),
        };
        let Some(set) = set else {
            return;
        };
        if !set.validators().is_proposer(&address) || set.aggregate().is_some() {
            return;
        }
        match set.make_aggregate_vote() {
            Ok(agg) => {
                info!(
                    "Sending aggregate {} for {} at {}/{}",
                    vote_type, agg.block_id, agg.height, agg.round
                );
                self.broadcast(ConsensusMessage::AggregateVote(agg));
            }
            Err(e) => warn!("Failed to aggregate {}s at round {}: {}", vote_type, round, e),
        }
    }

    /// Signs a vote for the current height and sends it to ourselves, then
    /// to the network: broadcast, or to the proposer in aggregate mode.
    fn sign_add_vote(&mut self, vote_type: VoteType, round: Round, block_id: BlockId) {
        let Some(signer) = self.signer.as_mut() else {
            return;
        };
        let address = signer.address();
        let Some((index, _)) = self.rs.validators.get_by_address(&address) else {
            debug!("Not a validator at height {}, not voting", self.rs.height);
            return;
        };
        let mut vote = Vote {
            vote_type,
            height: self.rs.height,
            round,
            block_id,
            validator_address: address,
            validator_index: index,
            timestamp: now_millis(),
            use_agg_sig: self.config.use_aggregate_signature,
            signature: Sig::default(),
        };
        if let Err(e) = signer.sign_vote(&self.state.chain_id, &mut vote) {
            error!("Failed to sign {} at {}/{}: {}", vote_type, vote.height, round, e);
            return;
        }
        info!("Signed {}", vote);

        self.send_internal(ConsensusMessage::Vote(vote.clone()));
        if !self.config.use_aggregate_signature {
            self.broadcast(ConsensusMessage::Vote(vote));
            return;
        }

        if let Some(proposer) = self.rs.proposer().filter(|p| *p != address) {
            self.unicast(ConsensusMessage::Vote(vote.clone()), PeerId::from(proposer));
            let (duration, step) = match vote_type {
                VoteType::Prevote => (self.config.prevote(round), RoundStep::AggPrevoteWait),
                VoteType::Precommit => (self.config.precommit(round), RoundStep::AggPrecommitWait),
            };
            self.schedule_timeout(duration, self.rs.height, round, step);
        }
        if self.gossip_votes.load(Ordering::SeqCst) {
            self.broadcast(ConsensusMessage::Vote(vote));
        }
    }

    /// Falls back from aggregation to gossiping individual votes, starting
    /// with our own vote for (round, type).
    fn enable_gossip(&mut self, round: Round, vote_type: VoteType) {
        self.gossip_votes.store(true, Ordering::SeqCst);
        let Some(address) = self.our_address() else {
            return;
        };
        let set = match vote_type {
            VoteType::Prevote => self.rs.votes.prevotes(round),
            VoteType::Precommit => self.rs.votes.precommits(round),
        };
        if let Some(vote) = set.and_then(|s| s.get_by_address(&address)).cloned() {
            debug!("Rebroadcasting our {}", vote);
            self.broadcast(ConsensusMessage::Vote(vote));
        }
    }
}

fn has_vote_msg(vote: &Vote) -> HasVoteMsg {
    HasVoteMsg {
        height: vote.height,
        round: vote.round,
        vote_type: vote.vote_type,
        index: vote.validator_index,
    }
}

/// Precommits that committed the last stored block, rebuilt from the seen
/// commit.
fn reconstruct_last_commit(
    store: &dyn ConsensusStore,
    state: &State,
) -> Result<Option<VoteSet>, FatalConsensusError> {
    if state.last_block_height == 0 {
        return Ok(None);
    }
    let height = state.last_block_height;
    let commit = store
        .load_seen_commit(height)
        .map_err(|e| FatalConsensusError::ReconstructLastCommit(e.to_string()))?
        .ok_or_else(|| {
            FatalConsensusError::ReconstructLastCommit(format!("no seen commit for {height}"))
        })?;

    let validators = validators_for_round(&state.last_validators, commit.round);
    let last_commit = VoteSet::from_commit(&state.chain_id, &commit, validators)
        .map_err(|e| FatalConsensusError::ReconstructLastCommit(e.to_string()))?;
    if !last_commit.has_two_thirds_majority() {
        return Err(FatalConsensusError::ReconstructLastCommit(format!(
            "seen commit for {height} has no +2/3 majority"
        )));
    }
    info!("Reconstructed last commit for height {} round {}", height, commit.round);
    Ok(Some(last_commit))
}
