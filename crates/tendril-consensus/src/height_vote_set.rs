use std::collections::{BTreeMap, HashMap};

use tendril_core::{AggregateVote, BlockId, Height, Round, ValidatorSet, Vote, VoteType};
use tracing::debug;

use crate::error::VoteError;
use crate::messages::PeerId;
use crate::vote_set::VoteSet;

/// Rounds a single peer may open ahead of our own round.
const MAX_CATCHUP_ROUNDS: usize = 2;

/// Votes further than this past our round are dropped unopened.
pub const MAX_ROUNDS_AHEAD: Round = 64;

#[derive(Debug, Clone)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// Validator view for `round` at a height whose round 0 view is `base`.
pub fn validators_for_round(base: &ValidatorSet, round: Round) -> ValidatorSet {
    let mut validators = base.clone();
    validators.increment_accum(round);
    validators
}

/// Prevotes and precommits for every round of one height.
///
/// Rounds `0..=round` always exist. Peers can open a few rounds beyond that
/// (catch-up rounds) so a round skip can be detected. A catch-up round is
/// only opened for a correctly signed message within [`MAX_ROUNDS_AHEAD`].
#[derive(Debug, Clone)]
pub struct HeightVoteSet {
    chain_id: String,
    height: Height,
    validators: ValidatorSet,
    round: Round,
    round_vote_sets: BTreeMap<Round, RoundVoteSet>,
    peer_catchup_rounds: HashMap<PeerId, Vec<Round>>,
}

impl HeightVoteSet {
    pub fn new(chain_id: impl Into<String>, height: Height, validators: ValidatorSet) -> Self {
        let mut hvs = HeightVoteSet {
            chain_id: chain_id.into(),
            height,
            validators,
            round: 0,
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        hvs.add_round(0);
        hvs
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    /// Round 0 validator view.
    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn round_validators(&self, round: Round) -> ValidatorSet {
        validators_for_round(&self.validators, round)
    }

    fn add_round(&mut self, round: Round) {
        if self.round_vote_sets.contains_key(&round) {
            return;
        }
        let validators = self.round_validators(round);
        let prevotes = VoteSet::new(
            self.chain_id.clone(),
            self.height,
            round,
            VoteType::Prevote,
            validators.clone(),
        );
        let precommits = VoteSet::new(
            self.chain_id.clone(),
            self.height,
            round,
            VoteType::Precommit,
            validators,
        );
        self.round_vote_sets
            .insert(round, RoundVoteSet { prevotes, precommits });
    }

    /// Tracks every round up to `round`. Lower rounds are a no-op.
    pub fn set_round(&mut self, round: Round) {
        if round < self.round {
            debug!("HeightVoteSet round {} is already past {}", self.round, round);
            return;
        }
        for r in self.round..=round {
            self.add_round(r);
        }
        self.round = round;
    }

    fn vote_set(&self, round: Round, vote_type: VoteType) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|rvs| match vote_type {
            VoteType::Prevote => &rvs.prevotes,
            VoteType::Precommit => &rvs.precommits,
        })
    }

    fn vote_set_mut(&mut self, round: Round, vote_type: VoteType) -> Option<&mut VoteSet> {
        self.round_vote_sets.get_mut(&round).map(|rvs| match vote_type {
            VoteType::Prevote => &mut rvs.prevotes,
            VoteType::Precommit => &mut rvs.precommits,
        })
    }

    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Prevote)
    }

    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Precommit)
    }

    pub fn precommits_mut(&mut self, round: Round) -> Option<&mut VoteSet> {
        self.vote_set_mut(round, VoteType::Precommit)
    }

    pub fn prevotes_mut(&mut self, round: Round) -> Option<&mut VoteSet> {
        self.vote_set_mut(round, VoteType::Prevote)
    }

    /// Opens `round` for `peer` if it is within the peer's catch-up budget.
    fn ensure_round(&mut self, round: Round, peer: &PeerId) -> Result<(), VoteError> {
        if self.round_vote_sets.contains_key(&round) {
            return Ok(());
        }
        if round > self.round.saturating_add(MAX_ROUNDS_AHEAD) {
            return Err(VoteError::RoundTooFarAhead {
                round,
                current: self.round,
            });
        }
        let rounds = self.peer_catchup_rounds.entry(peer.clone()).or_default();
        if rounds.len() >= MAX_CATCHUP_ROUNDS {
            return Err(VoteError::UnwantedRound(round));
        }
        rounds.push(round);
        self.add_round(round);
        Ok(())
    }

    /// Checks a vote against the round 0 view. Membership and keys are the
    /// same in every round, only proposer priorities differ.
    fn verify_unopened(&self, vote: &Vote) -> Result<(), VoteError> {
        let validator = self
            .validators
            .get_by_index(vote.validator_index)
            .ok_or(VoteError::InvalidValidatorIndex(vote.validator_index))?;
        vote.verify(&self.chain_id, &validator.pub_key)
            .map_err(|_| VoteError::InvalidSignature)
    }

    pub fn add_vote(&mut self, vote: Vote, peer: &PeerId) -> Result<bool, VoteError> {
        if !self.round_vote_sets.contains_key(&vote.round) {
            self.verify_unopened(&vote)?;
        }
        self.ensure_round(vote.round, peer)?;
        match self.vote_set_mut(vote.round, vote.vote_type) {
            Some(set) => set.add_vote(vote),
            None => Err(VoteError::UnwantedRound(vote.round)),
        }
    }

    pub fn add_aggregate_vote(
        &mut self,
        agg: AggregateVote,
        peer: &PeerId,
    ) -> Result<bool, VoteError> {
        if !self.round_vote_sets.contains_key(&agg.round) {
            agg.verify(&self.chain_id, &self.validators)
                .map_err(|e| VoteError::InvalidAggregate(e.to_string()))?;
        }
        self.ensure_round(agg.round, peer)?;
        match self.vote_set_mut(agg.round, agg.vote_type) {
            Some(set) => set.add_aggregate_vote(agg),
            None => Err(VoteError::UnwantedRound(agg.round)),
        }
    }

    /// Highest round with a non-nil prevote majority.
    pub fn pol_info(&self) -> Option<(Round, BlockId)> {
        self.round_vote_sets
            .iter()
            .rev()
            .filter(|(round, _)| **round <= self.round)
            .find_map(|(round, rvs)| {
                rvs.prevotes
                    .two_thirds_majority()
                    .filter(|block_id| !block_id.is_nil())
                    .map(|block_id| (*round, block_id))
            })
    }

    /// Records a peer's +2/3 claim for a round we track.
    pub fn set_peer_maj23(
        &mut self,
        round: Round,
        vote_type: VoteType,
        peer: PeerId,
        block_id: BlockId,
    ) -> Result<(), VoteError> {
        let set = self
            .vote_set_mut(round, vote_type)
            .ok_or(VoteError::UnwantedRound(round))?;
        set.set_peer_maj23(peer, block_id);
        Ok(())
    }

    /// Rounds with any vote state, ascending.
    pub fn rounds(&self) -> impl Iterator<Item = Round> + '_ {
        self.round_vote_sets.keys().copied()
    }
}
