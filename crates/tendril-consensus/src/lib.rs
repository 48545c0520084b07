//! Tendril Consensus - Round-based BFT consensus
//!
//! This crate provides vote tracking, the propose/prevote/precommit state
//! machine with locking and round skipping, timeouts, signing with double
//! sign protection, and the engine that drives it all from queues.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod height_vote_set;
pub mod messages;
pub mod round_state;
pub mod signer;
pub mod state_machine;
pub mod strategy;
pub mod timeout;
pub mod vote_set;

pub use config::ConsensusConfig;
pub use engine::{ConsensusEngine, ConsensusHandle, EngineBuilder, EngineStatus};
pub use error::{ConflictingVotes, ConsensusError, FatalConsensusError, VoteError};
pub use executor::{BlockExecutor, ExecutorError, ValidatorSource};
pub use height_vote_set::{validators_for_round, HeightVoteSet};
pub use messages::{ConsensusMessage, MsgInfo, PeerId};
pub use round_state::{RoundState, RoundStateSummary, RoundStep};
pub use signer::{LastSignState, LocalSigner, Signer, SignerError};
pub use state_machine::{outbound_channels, ConsensusState, NetworkOutbox, Outbound};
pub use strategy::{DefaultStrategy, ProposalStrategy};
pub use timeout::{ManualTimeouts, TimeoutInfo, TimeoutScheduler, TimeoutTicker};
pub use vote_set::VoteSet;
