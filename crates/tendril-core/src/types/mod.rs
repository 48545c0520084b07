pub mod bit_array;
pub mod block;
pub mod proposal;
pub mod validator;
pub mod vote;

pub use bit_array::BitArray;
pub use block::{tx_hash, Block, BlockHeader, BlockId, Commit, Tx};
pub use proposal::{Heartbeat, Proposal};
pub use validator::{
    has_quorum, quorum_threshold, Validator, ValidatorSet, ValidatorUpdate, MAX_TOTAL_VOTING_POWER,
};
pub use vote::{AggregateSignature, AggregateVote, Vote, VoteType};

/// Block height; the first block has height 1.
pub type Height = u64;

/// Round number within a height.
pub type Round = u32;

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
