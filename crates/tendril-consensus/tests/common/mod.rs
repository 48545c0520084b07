//! Shared setup for the consensus integration tests
//!
//! Nodes run `ConsensusState` directly with manual timeouts. Messages move
//! through an in-memory network so tests decide delivery order, drops and
//! when each timeout fires.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tendril_consensus::{
    outbound_channels, BlockExecutor, ConsensusConfig, ConsensusError, ConsensusState,
    ExecutorError, LocalSigner, ManualTimeouts, MsgInfo, NetworkOutbox, PeerId, RoundStep,
    TimeoutScheduler,
};
use tendril_core::{
    now_millis, Address, Block, BlockId, Commit, Hash, Height, KeyPair, Proposal, Round, Sig,
    ValidatorSet, Vote, VoteType,
};
use tendril_state::{GenesisDoc, GenesisValidator, KvConsensusStore, MemoryStorage, State};
use tokio::sync::mpsc;

pub const CHAIN_ID: &str = "tendril-test";

pub fn genesis(n: u8) -> GenesisDoc {
    GenesisDoc {
        chain_id: CHAIN_ID.into(),
        genesis_time: 1_700_000_000_000,
        validators: (1..=n)
            .map(|i| GenesisValidator {
                pub_key: KeyPair::from_seed(i).public,
                power: 10,
                name: format!("val{i}"),
            })
            .collect(),
        app_hash: Hash::ZERO,
    }
}

pub fn test_config() -> ConsensusConfig {
    ConsensusConfig {
        timeout_commit_ms: 10,
        ..Default::default()
    }
}

/// Blocks carry the queued txs; applying a block changes nothing but the
/// consensus state.
#[derive(Clone, Default)]
pub struct TestExecutor {
    pub txs: Arc<Mutex<Vec<Vec<u8>>>>,
    pub committed: Arc<Mutex<Vec<(Height, BlockId)>>>,
}

impl BlockExecutor for TestExecutor {
    fn create_proposal_block(
        &mut self,
        state: &State,
        round: Round,
        last_commit: Option<Commit>,
        proposer: Address,
    ) -> Result<Block, ExecutorError> {
        let txs = self.txs.lock().clone();
        Ok(state.make_block(round, txs, last_commit, proposer, now_millis()))
    }

    fn validate_block(&self, state: &State, block: &Block) -> Result<(), ExecutorError> {
        Ok(state.validate_block(block)?)
    }

    fn apply_block(
        &mut self,
        state: &State,
        block_id: BlockId,
        block: &Block,
    ) -> Result<State, ExecutorError> {
        self.committed.lock().push((block.header.height, block_id));
        self.txs.lock().clear();
        Ok(state.next_state(block_id, block, state.app_hash))
    }

    fn txs_available(&self) -> bool {
        !self.txs.lock().is_empty()
    }
}

pub struct TestNode {
    pub key: KeyPair,
    pub cs: ConsensusState,
    pub internal_rx: mpsc::Receiver<MsgInfo>,
    pub outbox: NetworkOutbox,
    pub timeouts: Arc<ManualTimeouts>,
    pub executor: TestExecutor,
    pub errors: Vec<String>,
}

impl TestNode {
    pub fn new(seed: u8, state: State, config: ConsensusConfig) -> Self {
        let key = KeyPair::from_seed(seed);
        let timeouts = Arc::new(ManualTimeouts::new());
        let executor = TestExecutor::default();
        let (outbound, internal_rx, outbox) = outbound_channels(config.internal_queue_size);
        let cs = ConsensusState::new(
            Arc::new(config),
            state,
            Box::new(executor.clone()),
            Box::new(KvConsensusStore::new(MemoryStorage::new())),
            timeouts.clone(),
            outbound,
        )
        .unwrap()
        .with_signer(Box::new(LocalSigner::new(key.secret.clone())));

        TestNode {
            key,
            cs,
            internal_rx,
            outbox,
            timeouts,
            executor,
            errors: Vec::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.cs.our_id().clone()
    }

    pub fn height(&self) -> Height {
        self.cs.round_state().height
    }

    pub fn round(&self) -> Round {
        self.cs.round_state().round
    }

    pub fn step(&self) -> RoundStep {
        self.cs.round_state().step
    }

    fn record(&mut self, result: Result<(), ConsensusError>) {
        if let Err(e) = result {
            assert!(!e.is_fatal(), "node {} halted: {}", self.id(), e);
            self.errors.push(e.to_string());
        }
    }

    pub fn handle_msg(&mut self, mi: MsgInfo) -> Result<(), ConsensusError> {
        let result = self.cs.handle_msg(mi);
        self.pump();
        result
    }

    /// Handles our own queued messages until the internal queue is empty.
    pub fn pump(&mut self) {
        while let Ok(mi) = self.internal_rx.try_recv() {
            let result = self.cs.handle_msg(mi);
            self.record(result);
        }
    }

    /// Fires every scheduled timeout for `step`; others stay scheduled.
    pub fn fire(&mut self, step: RoundStep) {
        for ti in self.timeouts.take() {
            if ti.step == step {
                let result = self.cs.handle_timeout(ti);
                self.record(result);
            } else {
                self.timeouts.schedule_timeout(ti);
            }
        }
        self.pump();
    }

    /// Fires the oldest scheduled timeout, if any.
    pub fn fire_first(&mut self) {
        let mut scheduled = self.timeouts.take().into_iter();
        let Some(first) = scheduled.next() else {
            return;
        };
        for ti in scheduled {
            self.timeouts.schedule_timeout(ti);
        }
        let result = self.cs.handle_timeout(first);
        self.record(result);
        self.pump();
    }

    pub fn start(&mut self) {
        self.cs.start();
        self.fire(RoundStep::NewHeight);
    }

    /// Everything broadcast since the last drain.
    pub fn drain_broadcast(&mut self) -> Vec<MsgInfo> {
        let mut out = Vec::new();
        while let Ok(mi) = self.outbox.broadcast.try_recv() {
            out.push(mi);
        }
        out
    }

    pub fn drain_unicast(&mut self) -> Vec<MsgInfo> {
        let mut out = Vec::new();
        while let Ok(mi) = self.outbox.unicast.try_recv() {
            out.push(mi);
        }
        out
    }

    pub fn committed(&self) -> Vec<(Height, BlockId)> {
        self.executor.committed.lock().clone()
    }

    pub fn own_vote(&self, round: Round, vote_type: VoteType) -> Option<Vote> {
        let votes = &self.cs.round_state().votes;
        let set = match vote_type {
            VoteType::Prevote => votes.prevotes(round),
            VoteType::Precommit => votes.precommits(round),
        }?;
        set.get_by_address(&self.key.address()).cloned()
    }
}

pub struct Envelope {
    pub from: usize,
    pub to: usize,
    pub mi: MsgInfo,
}

/// In-process validators connected by a FIFO network under test control.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub pending: VecDeque<Envelope>,
    pub down: Vec<bool>,
    /// Every delivered message with its recipient.
    pub delivered: Vec<(usize, MsgInfo)>,
}

impl TestCluster {
    pub fn new(n: u8, config: ConsensusConfig) -> Self {
        let state = State::from_genesis(&genesis(n)).unwrap();
        let nodes = (1..=n)
            .map(|seed| TestNode::new(seed, state.clone(), config.clone()))
            .collect();
        TestCluster {
            nodes,
            pending: VecDeque::new(),
            down: vec![false; n as usize],
            delivered: Vec::new(),
        }
    }

    pub fn live(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|i| !self.down[*i])
    }

    /// Index of the node proposing `round` of the current height.
    pub fn proposer_index(&self, round: Round) -> usize {
        let node = &self.nodes[0];
        let validators: ValidatorSet = node.cs.round_state().votes.round_validators(round);
        let proposer = validators.proposer().unwrap().address;
        self.nodes
            .iter()
            .position(|n| n.key.address() == proposer)
            .unwrap()
    }

    pub fn fire_first(&mut self, node: usize) {
        if self.down[node] {
            return;
        }
        self.nodes[node].fire_first();
        self.collect(node);
    }

    pub fn start(&mut self) {
        for i in self.live().collect::<Vec<_>>() {
            self.nodes[i].start();
        }
        self.collect_all();
    }

    pub fn fire(&mut self, step: RoundStep) {
        for i in self.live().collect::<Vec<_>>() {
            self.nodes[i].fire(step);
        }
        self.collect_all();
    }

    pub fn collect_all(&mut self) {
        for i in 0..self.nodes.len() {
            self.collect(i);
        }
    }

    fn collect(&mut self, from: usize) {
        let broadcast = self.nodes[from].drain_broadcast();
        let unicast = self.nodes[from].drain_unicast();
        if self.down[from] {
            return;
        }
        for mi in broadcast {
            for to in 0..self.nodes.len() {
                if to != from {
                    self.pending.push_back(Envelope {
                        from,
                        to,
                        mi: mi.clone(),
                    });
                }
            }
        }
        let sender = self.nodes[from].id();
        for mi in unicast {
            if let Some(to) = self.nodes.iter().position(|n| n.id() == mi.peer_id) {
                self.pending.push_back(Envelope {
                    from,
                    to,
                    mi: MsgInfo::new(mi.msg, sender.clone()),
                });
            }
        }
    }

    pub fn deliver(&mut self, envelope: Envelope) {
        let Envelope { from, to, mi } = envelope;
        if self.down[from] || self.down[to] {
            return;
        }
        self.delivered.push((to, mi.clone()));
        let result = self.nodes[to].handle_msg(mi);
        self.nodes[to].record(result);
        self.collect(to);
    }

    /// Delivers messages until the network is quiet.
    pub fn settle(&mut self) {
        let mut budget = 200_000;
        while let Some(envelope) = self.pending.pop_front() {
            budget -= 1;
            assert!(budget > 0, "network did not settle");
            self.deliver(envelope);
        }
    }

    /// Delivers messages until `done` holds; false if the network went quiet
    /// first.
    pub fn settle_until(&mut self, done: impl Fn(&TestCluster) -> bool) -> bool {
        let mut budget = 200_000;
        while !done(self) {
            let Some(envelope) = self.pending.pop_front() else {
                return false;
            };
            budget -= 1;
            assert!(budget > 0, "condition not reached");
            self.deliver(envelope);
        }
        true
    }

    /// Runs one height with every live node online and returns the block
    /// committed by the first live node.
    pub fn commit_height(&mut self) -> BlockId {
        let height = self.nodes[self.live().next().unwrap()].height();
        self.fire(RoundStep::NewHeight);
        self.settle();
        let first = self.live().next().unwrap();
        self.nodes[first]
            .committed()
            .into_iter()
            .find(|(h, _)| *h == height)
            .map(|(_, id)| id)
            .unwrap_or_else(|| panic!("height {height} was not committed"))
    }

    /// No two nodes committed different blocks at the same height.
    pub fn assert_agreement(&self) {
        for a in &self.nodes {
            for b in &self.nodes {
                for (ha, ida) in a.committed() {
                    for (hb, idb) in b.committed() {
                        if ha == hb {
                            assert_eq!(ida, idb, "conflicting commits at height {ha}");
                        }
                    }
                }
            }
        }
    }
}

pub fn signed_vote(
    key: &KeyPair,
    validators: &ValidatorSet,
    vote_type: VoteType,
    height: Height,
    round: Round,
    block_id: BlockId,
) -> Vote {
    let (index, _) = validators.get_by_address(&key.address()).unwrap();
    let mut vote = Vote {
        vote_type,
        height,
        round,
        block_id,
        validator_address: key.address(),
        validator_index: index,
        timestamp: now_millis(),
        use_agg_sig: false,
        signature: Sig::default(),
    };
    vote.sign(CHAIN_ID, &key.secret).unwrap();
    vote
}

pub fn signed_proposal(key: &KeyPair, block: &Block, round: Round, pol_round: Option<Round>) -> Proposal {
    let pol_block_id = if pol_round.is_some() { block.id() } else { BlockId::NIL };
    let mut proposal = Proposal::new(block.header.height, round, block.hash(), pol_round, pol_block_id);
    proposal.sign(CHAIN_ID, &key.secret).unwrap();
    proposal
}

pub fn peer(key: &KeyPair) -> PeerId {
    PeerId::from(key.address())
}
