use std::collections::HashMap;
use std::fmt;

use tendril_core::{
    has_quorum, quorum_threshold, Address, AggregateSignature, AggregateVote, BitArray, BlockId,
    Commit, Height, Round, ValidatorSet, Vote, VoteType,
};
use tracing::debug;

use crate::error::{ConflictingVotes, VoteError};
use crate::messages::PeerId;

/// Votes for one block id.
#[derive(Debug, Clone)]
struct BlockVotes {
    /// A peer claimed +2/3 for this block, so conflicting votes for it are
    /// still tracked.
    peer_maj23: bool,
    bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: u64,
}

impl BlockVotes {
    fn new(peer_maj23: bool, size: usize) -> Self {
        BlockVotes {
            peer_maj23,
            bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
        }
    }

    fn add_verified_vote(&mut self, vote: Vote, power: u64) {
        let index = vote.validator_index as usize;
        if self.votes[index].is_none() && !self.bit_array.get(index) {
            self.bit_array.set(index, true);
            self.sum += power;
        }
        self.votes[index] = Some(vote);
    }

    fn get_by_index(&self, index: usize) -> Option<&Vote> {
        self.votes.get(index).and_then(Option::as_ref)
    }
}

/// Votes of one type for one (height, round).
///
/// `votes` holds the canonical vote per validator: the first one seen, or
/// the one for the majority block once a majority exists. `votes_by_block`
/// tallies power per block id. A validator is counted in `sum` at most once,
/// whether through an individual vote or through an accepted aggregate.
#[derive(Debug, Clone)]
pub struct VoteSet {
    chain_id: String,
    height: Height,
    round: Round,
    vote_type: VoteType,
    validators: ValidatorSet,
    votes_bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: u64,
    maj23: Option<BlockId>,
    votes_by_block: HashMap<BlockId, BlockVotes>,
    peer_maj23s: HashMap<PeerId, BlockId>,
    aggregate: Option<AggregateVote>,
}

impl VoteSet {
    pub fn new(
        chain_id: impl Into<String>,
        height: Height,
        round: Round,
        vote_type: VoteType,
        validators: ValidatorSet,
    ) -> Self {
        let size = validators.len();
        VoteSet {
            chain_id: chain_id.into(),
            height,
            round,
            vote_type,
            validators,
            votes_bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
            maj23: None,
            votes_by_block: HashMap::new(),
            peer_maj23s: HashMap::new(),
            aggregate: None,
        }
    }

    /// Rebuilds the precommit set that produced `commit`.
    pub fn from_commit(
        chain_id: &str,
        commit: &Commit,
        validators: ValidatorSet,
    ) -> Result<Self, VoteError> {
        let mut set = VoteSet::new(
            chain_id,
            commit.height,
            commit.round,
            VoteType::Precommit,
            validators,
        );
        if let Some(agg) = &commit.aggregate {
            set.insert_aggregate(agg.clone(), false)?;
        }
        for vote in commit.precommits.iter().flatten() {
            set.add_vote(vote.clone())?;
        }
        Ok(set)
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// Adds a signed vote. Returns `Ok(false)` for a vote that changes
    /// nothing, such as an exact duplicate.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteError> {
        if vote.height != self.height || vote.round != self.round || vote.vote_type != self.vote_type
        {
            return Err(VoteError::UnexpectedStep {
                expected: format!("{}/{}/{}", self.height, self.round, self.vote_type),
                got: format!("{}/{}/{}", vote.height, vote.round, vote.vote_type),
            });
        }

        let index = vote.validator_index;
        let validator = self
            .validators
            .get_by_index(index)
            .ok_or(VoteError::InvalidValidatorIndex(index))?;
        if validator.address != vote.validator_address {
            return Err(VoteError::InvalidValidatorAddress(format!(
                "{} does not match {} at index {}",
                vote.validator_address, validator.address, index
            )));
        }
        if validator.voting_power == 0 {
            return Err(VoteError::ZeroVotingPower(index));
        }
        let power = validator.voting_power;
        let pub_key = validator.pub_key;

        if let Some(existing) = self.get_vote(index as usize, &vote.block_id) {
            if existing.signature == vote.signature {
                return Ok(false);
            }
            return Err(VoteError::NonDeterministicSignature(index));
        }

        vote.verify(&self.chain_id, &pub_key)
            .map_err(|_| VoteError::InvalidSignature)?;

        if self.covered_by_aggregate(index as usize) {
            if self.maj23 == Some(vote.block_id) {
                self.votes[index as usize] = Some(vote);
            } else {
                debug!("Ignoring vote {} from a validator covered by the aggregate", vote);
            }
            return Ok(false);
        }

        self.add_verified_vote(vote, power)
    }

    fn covered_by_aggregate(&self, index: usize) -> bool {
        self.aggregate.is_some() && self.votes_bit_array.get(index) && self.votes[index].is_none()
    }

    fn get_vote(&self, index: usize, block_id: &BlockId) -> Option<&Vote> {
        if let Some(existing) = self.votes[index].as_ref() {
            if existing.block_id == *block_id {
                return Some(existing);
            }
        }
        self.votes_by_block
            .get(block_id)
            .and_then(|bv| bv.get_by_index(index))
    }

    fn add_verified_vote(&mut self, vote: Vote, power: u64) -> Result<bool, VoteError> {
        let index = vote.validator_index as usize;
        let block_id = vote.block_id;

        let conflicting = match self.votes[index].clone() {
            Some(existing) => {
                if self.maj23 == Some(block_id) {
                    self.votes[index] = Some(vote.clone());
                }
                Some(existing)
            }
            None => {
                self.votes[index] = Some(vote.clone());
                self.votes_bit_array.set(index, true);
                self.sum += power;
                None
            }
        };

        if let Some(existing) = &conflicting {
            let peer_claimed = self
                .votes_by_block
                .get(&block_id)
                .is_some_and(|bv| bv.peer_maj23);
            if !peer_claimed {
                return Err(conflicting_votes(existing.clone(), vote, false));
            }
        }

        let size = self.size();
        let total = self.validators.total_voting_power();
        let block_votes = self
            .votes_by_block
            .entry(block_id)
            .or_insert_with(|| BlockVotes::new(false, size));
        let had_quorum = has_quorum(block_votes.sum, total);
        block_votes.add_verified_vote(vote.clone(), power);

        if !had_quorum && has_quorum(block_votes.sum, total) && self.maj23.is_none() {
            self.maj23 = Some(block_id);
            for (i, v) in block_votes.votes.iter().enumerate() {
                if let Some(v) = v {
                    self.votes[i] = Some(v.clone());
                }
            }
        }

        match conflicting {
            Some(existing) => Err(conflicting_votes(existing, vote, true)),
            None => Ok(true),
        }
    }

    /// Adds the proposer's aggregate. At most one is accepted, and only
    /// while no majority exists yet.
    pub fn add_aggregate_vote(&mut self, agg: AggregateVote) -> Result<bool, VoteError> {
        self.insert_aggregate(agg, true)
    }

    fn insert_aggregate(
        &mut self,
        agg: AggregateVote,
        check_aggregator: bool,
    ) -> Result<bool, VoteError> {
        if agg.height != self.height || agg.round != self.round || agg.vote_type != self.vote_type {
            return Err(VoteError::UnexpectedStep {
                expected: format!("{}/{}/{}", self.height, self.round, self.vote_type),
                got: format!("{}/{}/{}", agg.height, agg.round, agg.vote_type),
            });
        }
        if check_aggregator {
            let proposer = self.validators.proposer().map(|v| v.address);
            if proposer != Some(agg.aggregator) {
                return Err(VoteError::InvalidValidatorAddress(format!(
                    "aggregator {} is not the proposer",
                    agg.aggregator
                )));
            }
        }
        if self.aggregate.is_some() || self.maj23.is_some() {
            debug!("Ignoring redundant aggregate for {}/{}", self.height, self.round);
            return Ok(false);
        }

        let power = agg
            .verify(&self.chain_id, &self.validators)
            .map_err(|e| VoteError::InvalidAggregate(e.to_string()))?;
        let total = self.validators.total_voting_power();
        if !has_quorum(power, total) {
            return Err(VoteError::InsufficientAggregatePower {
                got: power,
                need: quorum_threshold(total),
            });
        }

        let merged = match self.votes_by_block.get(&agg.block_id) {
            Some(bv) => bv.bit_array.or(&agg.validator_array),
            None => agg.validator_array.clone(),
        };
        let merged_sum = self.power_of(&merged);
        let size = self.size();
        let block_votes = self
            .votes_by_block
            .entry(agg.block_id)
            .or_insert_with(|| BlockVotes::new(false, size));
        block_votes.bit_array = merged;
        block_votes.sum = merged_sum;

        self.votes_bit_array = self.votes_bit_array.or(&agg.validator_array);
        self.sum = self.power_of(&self.votes_bit_array);
        self.maj23 = Some(agg.block_id);
        self.aggregate = Some(agg);
        Ok(true)
    }

    fn power_of(&self, bits: &BitArray) -> u64 {
        bits.ones()
            .filter_map(|i| self.validators.get_by_index(i as u32))
            .map(|v| v.voting_power)
            .sum()
    }

    /// Builds the aggregate from the majority block's votes, signed for
    /// aggregation. Only the round proposer does this.
    pub fn make_aggregate_vote(&mut self) -> Result<AggregateVote, VoteError> {
        let block_id = self.maj23.ok_or(VoteError::NoMajority)?;
        let block_votes = self.votes_by_block.get(&block_id).ok_or(VoteError::NoMajority)?;
        let aggregator = self
            .validators
            .proposer()
            .map(|v| v.address)
            .ok_or_else(|| VoteError::InvalidAggregate("no proposer".into()))?;

        let mut validator_array = BitArray::new(self.size());
        let mut signatures = Vec::new();
        for (index, vote) in block_votes.votes.iter().enumerate() {
            if let Some(vote) = vote.as_ref().filter(|v| v.use_agg_sig) {
                validator_array.set(index, true);
                signatures.push(vote.signature);
            }
        }

        let agg = AggregateVote {
            vote_type: self.vote_type,
            height: self.height,
            round: self.round,
            block_id,
            aggregator,
            validator_array,
            signature: AggregateSignature(signatures),
        };
        let power = agg
            .verify(&self.chain_id, &self.validators)
            .map_err(|e| VoteError::InvalidAggregate(e.to_string()))?;
        let total = self.validators.total_voting_power();
        if !has_quorum(power, total) {
            return Err(VoteError::InsufficientAggregatePower {
                got: power,
                need: quorum_threshold(total),
            });
        }
        self.aggregate = Some(agg.clone());
        Ok(agg)
    }

    pub fn aggregate(&self) -> Option<&AggregateVote> {
        self.aggregate.as_ref()
    }

    /// Commit evidence for the precommit majority.
    pub fn make_commit(&self) -> Result<Commit, VoteError> {
        if self.vote_type != VoteType::Precommit {
            return Err(VoteError::UnexpectedStep {
                expected: VoteType::Precommit.to_string(),
                got: self.vote_type.to_string(),
            });
        }
        let block_id = self.maj23.ok_or(VoteError::NoMajority)?;
        Ok(Commit {
            block_id,
            height: self.height,
            round: self.round,
            precommits: self.votes.clone(),
            aggregate: self.aggregate.clone().filter(|agg| agg.block_id == block_id),
        })
    }

    /// Records a peer's +2/3 claim. Each peer gets one claim per set.
    pub fn set_peer_maj23(&mut self, peer: PeerId, block_id: BlockId) {
        if let Some(existing) = self.peer_maj23s.get(&peer) {
            if *existing != block_id {
                debug!("Peer {} changed its maj23 claim to {}", peer, block_id);
            }
            return;
        }
        self.peer_maj23s.insert(peer, block_id);

        let size = self.size();
        self.votes_by_block
            .entry(block_id)
            .and_modify(|bv| bv.peer_maj23 = true)
            .or_insert_with(|| BlockVotes::new(true, size));
    }

    pub fn bit_array(&self) -> &BitArray {
        &self.votes_bit_array
    }

    pub fn bit_array_by_block_id(&self, block_id: &BlockId) -> Option<BitArray> {
        self.votes_by_block.get(block_id).map(|bv| bv.bit_array.clone())
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize).and_then(Option::as_ref)
    }

    pub fn get_by_address(&self, address: &Address) -> Option<&Vote> {
        let (index, _) = self.validators.get_by_address(address)?;
        self.get_by_index(index)
    }

    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    pub fn has_two_thirds_any(&self) -> bool {
        has_quorum(self.sum, self.validators.total_voting_power())
    }

    pub fn has_all(&self) -> bool {
        self.sum == self.validators.total_voting_power()
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }
}

fn conflicting_votes(existing: Vote, new: Vote, added: bool) -> VoteError {
    VoteError::Conflicting(Box::new(ConflictingVotes {
        existing,
        new,
        added,
    }))
}

impl fmt::Display for VoteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VoteSet{{H:{} R:{} T:{} +2/3:",
            self.height, self.round, self.vote_type
        )?;
        match self.maj23 {
            Some(block_id) => write!(f, "{block_id}")?,
            None => f.write_str("none")?,
        }
        write!(f, " {:?} {}/{}}}", self.votes_bit_array, self.sum, self.validators.total_voting_power())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tendril_core::{Hash, KeyPair, Validator};

    const CHAIN: &str = "tendril-test";

    fn keys(n: u8) -> Vec<KeyPair> {
        let mut keys: Vec<KeyPair> = (1..=n).map(KeyPair::from_seed).collect();
        keys.sort_by_key(|k| k.address());
        keys
    }

    fn validator_set(keys: &[KeyPair], power: u64) -> ValidatorSet {
        ValidatorSet::new(keys.iter().map(|k| Validator::new(k.public, power)).collect()).unwrap()
    }

    fn vote(keys: &[KeyPair], index: usize, vote_type: VoteType, round: Round, block: BlockId) -> Vote {
        let mut vote = Vote {
            vote_type,
            height: 1,
            round,
            block_id: block,
            validator_address: keys[index].address(),
            validator_index: index as u32,
            timestamp: 1_000 + index as u64,
            use_agg_sig: false,
            signature: Default::default(),
        };
        vote.sign(CHAIN, &keys[index].secret).unwrap();
        vote
    }

    fn block(byte: u8) -> BlockId {
        BlockId::new(Hash([byte; 32]))
    }

    #[test]
    fn test_two_thirds_majority() {
        let keys = keys(4);
        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, validator_set(&keys, 1));

        assert!(set.add_vote(vote(&keys, 0, VoteType::Prevote, 0, block(1))).unwrap());
        assert!(set.add_vote(vote(&keys, 1, VoteType::Prevote, 0, block(1))).unwrap());
        assert_eq!(set.two_thirds_majority(), None);
        assert!(!set.has_two_thirds_any());

        assert!(set.add_vote(vote(&keys, 2, VoteType::Prevote, 0, block(1))).unwrap());
        assert_eq!(set.two_thirds_majority(), Some(block(1)));
        assert!(set.has_two_thirds_any());
        assert!(!set.has_all());
    }

    #[test]
    fn test_split_has_any_without_majority() {
        let keys = keys(4);
        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, validator_set(&keys, 1));
        set.add_vote(vote(&keys, 0, VoteType::Prevote, 0, block(1))).unwrap();
        set.add_vote(vote(&keys, 1, VoteType::Prevote, 0, block(1))).unwrap();
        set.add_vote(vote(&keys, 2, VoteType::Prevote, 0, BlockId::NIL)).unwrap();
        set.add_vote(vote(&keys, 3, VoteType::Prevote, 0, BlockId::NIL)).unwrap();

        assert_eq!(set.two_thirds_majority(), None);
        assert!(set.has_two_thirds_any());
        assert!(set.has_all());
    }

    #[test]
    fn test_nil_majority() {
        let keys = keys(4);
        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Precommit, validator_set(&keys, 1));
        for i in 0..3 {
            set.add_vote(vote(&keys, i, VoteType::Precommit, 0, BlockId::NIL)).unwrap();
        }
        assert_eq!(set.two_thirds_majority(), Some(BlockId::NIL));
    }

    #[test]
    fn test_duplicate_is_noop() {
        let keys = keys(4);
        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, validator_set(&keys, 1));
        let v = vote(&keys, 0, VoteType::Prevote, 0, block(1));
        assert!(set.add_vote(v.clone()).unwrap());
        assert!(!set.add_vote(v).unwrap());
        assert_eq!(set.sum(), 1);
    }

    #[test]
    fn test_rejections() {
        let keys = keys(4);
        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, validator_set(&keys, 1));

        let wrong_round = vote(&keys, 0, VoteType::Prevote, 1, block(1));
        assert_matches!(set.add_vote(wrong_round), Err(VoteError::UnexpectedStep { .. }));

        let wrong_type = vote(&keys, 0, VoteType::Precommit, 0, block(1));
        assert_matches!(set.add_vote(wrong_type), Err(VoteError::UnexpectedStep { .. }));

        let mut bad_index = vote(&keys, 0, VoteType::Prevote, 0, block(1));
        bad_index.validator_index = 9;
        assert_matches!(set.add_vote(bad_index), Err(VoteError::InvalidValidatorIndex(9)));

        let mut bad_address = vote(&keys, 0, VoteType::Prevote, 0, block(1));
        bad_address.validator_index = 1;
        assert_matches!(set.add_vote(bad_address), Err(VoteError::InvalidValidatorAddress(_)));

        let mut forged = vote(&keys, 0, VoteType::Prevote, 0, block(1));
        forged.block_id = block(2);
        assert_matches!(set.add_vote(forged), Err(VoteError::InvalidSignature));

        let mut resigned = vote(&keys, 0, VoteType::Prevote, 0, block(1));
        set.add_vote(resigned.clone()).unwrap();
        resigned.timestamp += 1;
        resigned.sign(CHAIN, &keys[0].secret).unwrap();
        assert_matches!(set.add_vote(resigned), Err(VoteError::NonDeterministicSignature(0)));
        assert_eq!(set.sum(), 1);
    }

    #[test]
    fn test_conflicting_vote_is_equivocation() {
        let keys = keys(4);
        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, validator_set(&keys, 1));
        set.add_vote(vote(&keys, 0, VoteType::Prevote, 0, block(1))).unwrap();

        let err = set.add_vote(vote(&keys, 0, VoteType::Prevote, 0, block(2))).unwrap_err();
        assert_matches!(err, VoteError::Conflicting(ref c) if c.existing.block_id == block(1) && !c.added);
        assert_eq!(set.sum(), 1);
        assert_eq!(set.bit_array_by_block_id(&block(2)), None);
    }

    #[test]
    fn test_peer_maj23_tracks_conflicts() {
        let keys = keys(4);
        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, validator_set(&keys, 1));
        set.add_vote(vote(&keys, 0, VoteType::Prevote, 0, block(1))).unwrap();
        set.set_peer_maj23(PeerId::from("peer"), block(2));

        assert!(set.add_vote(vote(&keys, 0, VoteType::Prevote, 0, block(2))).is_err());
        let bits = set.bit_array_by_block_id(&block(2)).unwrap();
        assert!(bits.get(0));
        assert_eq!(set.sum(), 1);
    }

    #[test]
    fn test_conflicting_vote_can_complete_claimed_majority() {
        let keys = keys(4);
        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, validator_set(&keys, 1));
        set.add_vote(vote(&keys, 0, VoteType::Prevote, 0, block(1))).unwrap();
        set.set_peer_maj23(PeerId::from("peer"), block(2));
        set.add_vote(vote(&keys, 1, VoteType::Prevote, 0, block(2))).unwrap();
        set.add_vote(vote(&keys, 2, VoteType::Prevote, 0, block(2))).unwrap();
        assert_eq!(set.two_thirds_majority(), None);

        let err = set.add_vote(vote(&keys, 0, VoteType::Prevote, 0, block(2))).unwrap_err();
        assert_matches!(err, VoteError::Conflicting(ref c) if c.added && c.new.block_id == block(2));
        assert_eq!(set.two_thirds_majority(), Some(block(2)));
    }

    #[test]
    fn test_zero_power_validator() {
        let keys = keys(2);
        let mut validators = vec![Validator::new(keys[0].public, 0), Validator::new(keys[1].public, 5)];
        validators.sort_by_key(|v| v.address);
        let set_validators = ValidatorSet::new(validators).unwrap();
        let (zero_index, _) = set_validators.get_by_address(&keys[0].address()).unwrap();

        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, set_validators);
        let mut v = vote(&keys, 0, VoteType::Prevote, 0, block(1));
        v.validator_index = zero_index;
        v.sign(CHAIN, &keys[0].secret).unwrap();
        assert_matches!(set.add_vote(v), Err(VoteError::ZeroVotingPower(_)));
    }

    fn agg_vote(keys: &[KeyPair], index: usize, round: Round, block: BlockId) -> Vote {
        let mut v = vote(keys, index, VoteType::Precommit, round, block);
        v.use_agg_sig = true;
        v.sign(CHAIN, &keys[index].secret).unwrap();
        v
    }

    fn proposer_index(set: &ValidatorSet) -> usize {
        let proposer = set.proposer().unwrap().address;
        set.get_by_address(&proposer).unwrap().0 as usize
    }

    #[test]
    fn test_aggregate_round_trip() {
        let keys = keys(4);
        let validators = validator_set(&keys, 1);
        let mut collector = VoteSet::new(CHAIN, 1, 0, VoteType::Precommit, validators.clone());
        for i in 0..3 {
            collector.add_vote(agg_vote(&keys, i, 0, block(7))).unwrap();
        }
        let agg = collector.make_aggregate_vote().unwrap();
        assert_eq!(agg.validator_array.count_ones(), 3);
        assert_eq!(agg.aggregator, validators.proposer().unwrap().address);

        let mut receiver = VoteSet::new(CHAIN, 1, 0, VoteType::Precommit, validators.clone());
        assert!(receiver.add_aggregate_vote(agg.clone()).unwrap());
        assert_eq!(receiver.two_thirds_majority(), Some(block(7)));
        assert_eq!(receiver.sum(), 3);

        // Second aggregate and covered individual votes change nothing.
        assert!(!receiver.add_aggregate_vote(agg).unwrap());
        assert!(!receiver.add_vote(agg_vote(&keys, 0, 0, block(7))).unwrap());
        assert_eq!(receiver.sum(), 3);

        // The missing validator still counts once.
        assert!(receiver.add_vote(agg_vote(&keys, 3, 0, block(7))).unwrap());
        assert_eq!(receiver.sum(), 4);
        assert!(receiver.has_all());

        let commit = receiver.make_commit().unwrap();
        assert!(commit.aggregate.is_some());
        validators.verify_commit(CHAIN, block(7), 1, &commit).unwrap();
    }

    #[test]
    fn test_aggregate_rejections() {
        let keys = keys(4);
        let validators = validator_set(&keys, 1);
        let proposer = proposer_index(&validators);
        let mut collector = VoteSet::new(CHAIN, 1, 0, VoteType::Precommit, validators.clone());
        for i in 0..3 {
            collector.add_vote(agg_vote(&keys, i, 0, block(7))).unwrap();
        }
        let agg = collector.make_aggregate_vote().unwrap();

        let mut receiver = VoteSet::new(CHAIN, 1, 0, VoteType::Precommit, validators.clone());
        let mut wrong_aggregator = agg.clone();
        wrong_aggregator.aggregator = keys[(proposer + 1) % 4].address();
        assert_matches!(
            receiver.add_aggregate_vote(wrong_aggregator),
            Err(VoteError::InvalidValidatorAddress(_))
        );

        let mut short_bitmap = agg.clone();
        short_bitmap.validator_array = BitArray::new(3);
        assert_matches!(receiver.add_aggregate_vote(short_bitmap), Err(VoteError::InvalidAggregate(_)));

        let mut too_small = agg.clone();
        let first = too_small.validator_array.ones().next().unwrap();
        let mut bits = BitArray::new(4);
        bits.set(first, true);
        too_small.validator_array = bits;
        too_small.signature = AggregateSignature(vec![agg.signature.0[0]]);
        assert_matches!(
            receiver.add_aggregate_vote(too_small),
            Err(VoteError::InsufficientAggregatePower { got: 1, need: 3 })
        );
        assert!(!receiver.has_two_thirds_majority());
    }

    #[test]
    fn test_aggregate_ignored_after_majority() {
        let keys = keys(4);
        let validators = validator_set(&keys, 1);
        let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Precommit, validators);
        for i in 0..3 {
            set.add_vote(agg_vote(&keys, i, 0, block(7))).unwrap();
        }
        let agg = set.clone().make_aggregate_vote().unwrap();
        assert!(!set.add_aggregate_vote(agg).unwrap());
        assert_eq!(set.sum(), 3);
    }

    #[test]
    fn test_make_commit_and_rebuild() {
        let keys = keys(4);
        let validators = validator_set(&keys, 1);
        let mut set = VoteSet::new(CHAIN, 1, 2, VoteType::Precommit, validators.clone());
        assert_matches!(set.make_commit(), Err(VoteError::NoMajority));
        for i in 0..3 {
            set.add_vote(vote(&keys, i, VoteType::Precommit, 2, block(4))).unwrap();
        }
        set.add_vote(vote(&keys, 3, VoteType::Precommit, 2, BlockId::NIL)).unwrap();

        let commit = set.make_commit().unwrap();
        assert_eq!(commit.round, 2);
        assert_eq!(commit.block_id, block(4));
        assert_eq!(commit.precommits.iter().flatten().count(), 4);
        validators.verify_commit(CHAIN, block(4), 1, &commit).unwrap();

        let rebuilt = VoteSet::from_commit(CHAIN, &commit, validators).unwrap();
        assert_eq!(rebuilt.two_thirds_majority(), Some(block(4)));
        assert!(rebuilt.has_all());
    }

    #[test]
    fn test_prevote_set_cannot_make_commit() {
        let keys = keys(4);
        let set = VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, validator_set(&keys, 1));
        assert_matches!(set.make_commit(), Err(VoteError::UnexpectedStep { .. }));
    }
}
