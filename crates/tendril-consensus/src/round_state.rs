use std::fmt;

use serde::{Deserialize, Serialize};
use tendril_core::{Address, Block, BlockId, Hash, Height, Proposal, Round, ValidatorSet};
use tendril_state::State;
use tokio::time::Instant;

use crate::height_vote_set::HeightVoteSet;
use crate::messages::NewRoundStepMsg;
use crate::vote_set::VoteSet;

/// Steps of a round, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RoundStep {
    /// Waiting for the commit timeout to start round 0.
    NewHeight = 1,
    NewRound = 2,
    Propose = 3,
    Prevote = 4,
    /// Sent our prevote to the proposer, waiting for its aggregate.
    AggPrevoteWait = 5,
    /// Saw +2/3 of any prevotes.
    PrevoteWait = 6,
    Precommit = 7,
    /// Sent our precommit to the proposer, waiting for its aggregate.
    AggPrecommitWait = 8,
    /// Saw +2/3 of any precommits.
    PrecommitWait = 9,
    Commit = 10,
}

impl fmt::Display for RoundStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundStep::NewHeight => "NewHeight",
            RoundStep::NewRound => "NewRound",
            RoundStep::Propose => "Propose",
            RoundStep::Prevote => "Prevote",
            RoundStep::AggPrevoteWait => "AggPrevoteWait",
            RoundStep::PrevoteWait => "PrevoteWait",
            RoundStep::Precommit => "Precommit",
            RoundStep::AggPrecommitWait => "AggPrecommitWait",
            RoundStep::PrecommitWait => "PrecommitWait",
            RoundStep::Commit => "Commit",
        };
        f.write_str(name)
    }
}

/// Everything the state machine knows about the current height.
#[derive(Debug, Clone)]
pub struct RoundState {
    pub height: Height,
    pub round: Round,
    pub step: RoundStep,
    pub start_time: Instant,
    /// When +2/3 precommits for a block were seen.
    pub commit_time: Option<Instant>,
    /// Validator view of the current round.
    pub validators: ValidatorSet,
    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    /// The block we want, possibly before we hold it.
    pub proposal_block_hash: Option<Hash>,
    pub locked_round: Option<Round>,
    pub locked_block: Option<Block>,
    /// Last round with a polka for a block we know to be valid.
    pub valid_round: Option<Round>,
    pub valid_block: Option<Block>,
    pub votes: HeightVoteSet,
    pub commit_round: Option<Round>,
    /// Precommits that committed the previous height.
    pub last_commit: Option<VoteSet>,
    pub last_validators: ValidatorSet,
}

impl RoundState {
    /// Round 0 of the height after `state`.
    pub fn new(state: &State, start_time: Instant, last_commit: Option<VoteSet>) -> Self {
        let height = state.next_height();
        RoundState {
            height,
            round: 0,
            step: RoundStep::NewHeight,
            start_time,
            commit_time: None,
            validators: state.validators.clone(),
            proposal: None,
            proposal_block: None,
            proposal_block_hash: None,
            locked_round: None,
            locked_block: None,
            valid_round: None,
            valid_block: None,
            votes: HeightVoteSet::new(state.chain_id.clone(), height, state.validators.clone()),
            commit_round: None,
            last_commit,
            last_validators: state.last_validators.clone(),
        }
    }

    pub fn proposer(&self) -> Option<Address> {
        self.validators.proposer().map(|v| v.address)
    }

    pub fn is_proposal_complete(&self) -> bool {
        let (Some(proposal), Some(_)) = (&self.proposal, &self.proposal_block) else {
            return false;
        };
        match proposal.pol_round {
            None => true,
            Some(pol_round) => self
                .votes
                .prevotes(pol_round)
                .is_some_and(VoteSet::has_two_thirds_majority),
        }
    }

    pub fn new_round_step_msg(&self) -> NewRoundStepMsg {
        NewRoundStepMsg {
            height: self.height,
            round: self.round,
            step: self.step,
            seconds_since_start_time: Instant::now()
                .saturating_duration_since(self.start_time)
                .as_secs(),
            last_commit_round: self.last_commit.as_ref().map(VoteSet::round),
        }
    }

    pub fn summary(&self) -> RoundStateSummary {
        let block_hash = |block: &Option<Block>| block.as_ref().map(Block::hash);
        let votes = self
            .votes
            .rounds()
            .filter_map(|round| {
                let prevotes = self.votes.prevotes(round)?;
                let precommits = self.votes.precommits(round)?;
                Some(RoundVotesSummary {
                    round,
                    prevotes: prevotes.bit_array().to_string(),
                    prevotes_maj23: prevotes.two_thirds_majority(),
                    precommits: precommits.bit_array().to_string(),
                    precommits_maj23: precommits.two_thirds_majority(),
                })
            })
            .collect();

        RoundStateSummary {
            height: self.height,
            round: self.round,
            step: self.step,
            proposer: self.proposer(),
            proposal: self.proposal.clone(),
            proposal_block_hash: self.proposal_block_hash,
            locked_round: self.locked_round,
            locked_block_hash: block_hash(&self.locked_block),
            valid_round: self.valid_round,
            valid_block_hash: block_hash(&self.valid_block),
            commit_round: self.commit_round,
            votes,
            last_commit: self.last_commit.as_ref().map(|lc| lc.bit_array().to_string()),
        }
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoundState{{H:{} R:{} S:{}}}", self.height, self.round, self.step)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundVotesSummary {
    pub round: Round,
    pub prevotes: String,
    pub prevotes_maj23: Option<BlockId>,
    pub precommits: String,
    pub precommits_maj23: Option<BlockId>,
}

/// Plain-data view of a [`RoundState`] for RPC and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStateSummary {
    pub height: Height,
    pub round: Round,
    pub step: RoundStep,
    pub proposer: Option<Address>,
    pub proposal: Option<Proposal>,
    pub proposal_block_hash: Option<Hash>,
    pub locked_round: Option<Round>,
    pub locked_block_hash: Option<Hash>,
    pub valid_round: Option<Round>,
    pub valid_block_hash: Option<Hash>,
    pub commit_round: Option<Round>,
    pub votes: Vec<RoundVotesSummary>,
    pub last_commit: Option<String>,
}
