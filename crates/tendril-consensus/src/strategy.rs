use tendril_core::{Address, Block, BlockId, Proposal};
use tendril_state::State;
use tracing::{debug, warn};

use crate::error::ConsensusError;
use crate::executor::{BlockExecutor, ExecutorError};
use crate::round_state::RoundState;

/// Pluggable decisions of the proposer and of every prevoter.
pub trait ProposalStrategy: Send {
    /// Block to propose this round, or `None` to skip proposing.
    fn decide_proposal(
        &mut self,
        rs: &RoundState,
        state: &State,
        executor: &mut dyn BlockExecutor,
        proposer: Address,
    ) -> Result<Option<Block>, ExecutorError>;

    /// Block id to prevote for; nil when nothing acceptable is held.
    fn decide_prevote(
        &mut self,
        rs: &RoundState,
        state: &State,
        executor: &dyn BlockExecutor,
    ) -> BlockId;

    /// Checks a proposal received for the current round.
    fn verify_proposal(
        &self,
        proposal: &Proposal,
        rs: &RoundState,
        chain_id: &str,
    ) -> Result<(), ConsensusError>;
}

/// Re-proposes the valid block if there is one, prevotes for the locked
/// block first and accepts proposals signed by the round proposer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStrategy;

impl ProposalStrategy for DefaultStrategy {
    fn decide_proposal(
        &mut self,
        rs: &RoundState,
        state: &State,
        executor: &mut dyn BlockExecutor,
        proposer: Address,
    ) -> Result<Option<Block>, ExecutorError> {
        if let Some(block) = &rs.valid_block {
            return Ok(Some(block.clone()));
        }

        let last_commit = if rs.height == 1 {
            None
        } else {
            let commit = rs
                .last_commit
                .as_ref()
                .ok_or_else(|| ExecutorError::InvalidBlock("no last commit".into()))
                .and_then(|lc| {
                    lc.make_commit()
                        .map_err(|e| ExecutorError::InvalidBlock(e.to_string()))
                });
            match commit {
                Ok(commit) => Some(commit),
                Err(e) => {
                    warn!("Cannot propose at {}/{} without last commit: {}", rs.height, rs.round, e);
                    return Ok(None);
                }
            }
        };

        executor
            .create_proposal_block(state, rs.round, last_commit, proposer)
            .map(Some)
    }

    fn decide_prevote(
        &mut self,
        rs: &RoundState,
        state: &State,
        executor: &dyn BlockExecutor,
    ) -> BlockId {
        if let Some(locked) = &rs.locked_block {
            debug!("Prevoting locked block {}", locked.hash().short());
            return locked.id();
        }
        let Some(block) = &rs.proposal_block else {
            debug!("No proposal block at {}/{}, prevoting nil", rs.height, rs.round);
            return BlockId::NIL;
        };
        match executor.validate_block(state, block) {
            Ok(()) => block.id(),
            Err(e) => {
                warn!("Proposal block {} is invalid: {}", block.hash().short(), e);
                BlockId::NIL
            }
        }
    }

    fn verify_proposal(
        &self,
        proposal: &Proposal,
        rs: &RoundState,
        chain_id: &str,
    ) -> Result<(), ConsensusError> {
        if let Some(pol_round) = proposal.pol_round {
            if pol_round >= proposal.round {
                return Err(ConsensusError::InvalidProposalPolRound {
                    pol_round,
                    round: proposal.round,
                });
            }
        }
        let proposer = rs
            .validators
            .proposer()
            .ok_or(ConsensusError::InvalidProposalSignature)?;
        proposal
            .verify(chain_id, &proposer.pub_key)
            .map_err(|_| ConsensusError::InvalidProposalSignature)
    }
}
