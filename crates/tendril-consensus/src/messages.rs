use std::fmt;

use serde::{Deserialize, Serialize};
use tendril_core::{
    Address, AggregateVote, BitArray, Block, BlockId, Hash, Heartbeat, Height, Proposal, Round,
    Vote, VoteType,
};

use crate::round_state::RoundStep;

/// Transport-level identity of a peer. Validators use their address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl From<Address> for PeerId {
    fn from(address: Address) -> Self {
        PeerId(address.to_hex())
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Announces our (height, round, step).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRoundStepMsg {
    pub height: Height,
    pub round: Round,
    pub step: RoundStep,
    pub seconds_since_start_time: u64,
    pub last_commit_round: Option<Round>,
}

/// A block that has a polka (or a commit) and that peers should send us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidBlockMsg {
    pub height: Height,
    pub round: Round,
    pub block_hash: Hash,
    pub is_commit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasVoteMsg {
    pub height: Height,
    pub round: Round,
    pub vote_type: VoteType,
    pub index: u32,
}

/// A peer claims +2/3 of `vote_type` votes for `block_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSetMaj23Msg {
    pub height: Height,
    pub round: Round,
    pub vote_type: VoteType,
    pub block_id: BlockId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalPolMsg {
    pub height: Height,
    pub pol_round: Round,
    pub pol: BitArray,
}

/// Which votes for `block_id` we hold, in answer to a [`VoteSetMaj23Msg`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSetBitsMsg {
    pub height: Height,
    pub round: Round,
    pub vote_type: VoteType,
    pub block_id: BlockId,
    pub votes: BitArray,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    ProposalBlock(Box<Block>),
    Vote(Vote),
    AggregateVote(AggregateVote),
    NewRoundStep(NewRoundStepMsg),
    ValidBlock(ValidBlockMsg),
    HasVote(HasVoteMsg),
    VoteSetMaj23(VoteSetMaj23Msg),
    ProposalPol(ProposalPolMsg),
    VoteSetBits(VoteSetBitsMsg),
    Heartbeat(Heartbeat),
}

impl ConsensusMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusMessage::Proposal(_) => "Proposal",
            ConsensusMessage::ProposalBlock(_) => "ProposalBlock",
            ConsensusMessage::Vote(_) => "Vote",
            ConsensusMessage::AggregateVote(_) => "AggregateVote",
            ConsensusMessage::NewRoundStep(_) => "NewRoundStep",
            ConsensusMessage::ValidBlock(_) => "ValidBlock",
            ConsensusMessage::HasVote(_) => "HasVote",
            ConsensusMessage::VoteSetMaj23(_) => "VoteSetMaj23",
            ConsensusMessage::ProposalPol(_) => "ProposalPol",
            ConsensusMessage::VoteSetBits(_) => "VoteSetBits",
            ConsensusMessage::Heartbeat(_) => "Heartbeat",
        }
    }
}

/// Envelope between the engine and the transport. `peer_id` is the sender
/// for inbound and broadcast messages and the destination for unicast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgInfo {
    pub msg: ConsensusMessage,
    pub peer_id: PeerId,
}

impl MsgInfo {
    pub fn new(msg: ConsensusMessage, peer_id: PeerId) -> Self {
        MsgInfo { msg, peer_id }
    }
}
