use tendril_core::{Height, Round, Vote};
use thiserror::Error;

use crate::round_state::RoundStep;

/// Two different votes from one validator at the same (height, round, type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingVotes {
    pub existing: Vote,
    pub new: Vote,
    /// The new vote was still counted, because a peer claimed +2/3 for its
    /// block.
    pub added: bool,
}

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("Unexpected step: vote for {got}, set tracks {expected}")]
    UnexpectedStep { expected: String, got: String },

    #[error("Invalid validator index {0}")]
    InvalidValidatorIndex(u32),

    #[error("Invalid validator address: {0}")]
    InvalidValidatorAddress(String),

    #[error("Invalid vote signature")]
    InvalidSignature,

    #[error("Non-deterministic signature from validator {0}")]
    NonDeterministicSignature(u32),

    #[error("Conflicting votes: existing {}, new {}", .0.existing, .0.new)]
    Conflicting(Box<ConflictingVotes>),

    #[error("Validator {0} has no voting power")]
    ZeroVotingPower(u32),

    #[error("Peer sent votes for too many catch-up rounds (round {0})")]
    UnwantedRound(Round),

    #[error("Round {round} is too far ahead of round {current}")]
    RoundTooFarAhead { round: Round, current: Round },

    #[error("Invalid aggregate vote: {0}")]
    InvalidAggregate(String),

    #[error("Aggregate covers {got} voting power, need {need}")]
    InsufficientAggregatePower { got: u64, need: u64 },

    #[error("No +2/3 majority")]
    NoMajority,
}

impl VoteError {
    /// Every rejection except a missing majority is caused by the message.
    pub fn is_peer_fault(&self) -> bool {
        !matches!(self, VoteError::NoMajority)
    }
}

/// Invariant violations. The engine stops instead of continuing unsafely.
#[derive(Debug, Error)]
pub enum FatalConsensusError {
    #[error("Conflicting vote from our own key at {height}/{round}")]
    ConflictingOwnVote { height: Height, round: Round },

    #[error("{step} at {height}/{round} without the required +2/3 votes")]
    MissingQuorum {
        height: Height,
        round: Round,
        step: RoundStep,
    },

    #[error("+2/3 prevoted for an invalid block: {0}")]
    InvalidPolkaBlock(String),

    #[error("POL round should be {expected} but got {got:?}")]
    PolRoundMismatch { expected: Round, got: Option<Round> },

    #[error("Committed block failed validation: {0}")]
    InvalidCommittedBlock(String),

    #[error("Failed to apply block at height {height}: {reason}")]
    ApplyBlock { height: Height, reason: String },

    #[error("Failed to persist consensus state: {0}")]
    Persist(String),

    #[error("Unexpected consensus state: {0}")]
    UnexpectedState(String),

    #[error("Invalid timeout step {0}")]
    InvalidTimeoutStep(RoundStep),

    #[error("Failed to reconstruct last commit: {0}")]
    ReconstructLastCommit(String),
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Vote rejected: {0}")]
    Vote(#[from] VoteError),

    #[error("Height mismatch: expected {expected}, got {got}")]
    HeightMismatch { expected: Height, got: Height },

    #[error("Invalid proposal signature")]
    InvalidProposalSignature,

    #[error("Invalid proposal POL round {pol_round} for round {round}")]
    InvalidProposalPolRound { pol_round: Round, round: Round },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Consensus queue is full")]
    QueueFull,

    #[error("Consensus engine stopped")]
    EngineStopped,

    #[error("Fatal: {0}")]
    Fatal(#[from] FatalConsensusError),
}

impl ConsensusError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::Fatal(_))
    }

    /// Protocol violations a transport layer may hold the sending peer
    /// responsible for.
    pub fn is_peer_fault(&self) -> bool {
        match self {
            ConsensusError::Vote(e) => e.is_peer_fault(),
            ConsensusError::HeightMismatch { .. }
            | ConsensusError::InvalidProposalSignature
            | ConsensusError::InvalidProposalPolRound { .. } => true,
            _ => false,
        }
    }

    pub fn is_equivocation(&self) -> bool {
        matches!(self, ConsensusError::Vote(VoteError::Conflicting(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let mismatch = ConsensusError::HeightMismatch { expected: 6, got: 5 };
        assert!(mismatch.is_peer_fault());
        assert!(!mismatch.is_fatal());

        let fatal = ConsensusError::from(FatalConsensusError::Persist("disk".into()));
        assert!(fatal.is_fatal());
        assert!(!fatal.is_peer_fault());

        let internal = ConsensusError::from(VoteError::NoMajority);
        assert!(!internal.is_peer_fault());
        assert!(!ConsensusError::QueueFull.is_equivocation());
    }
}
