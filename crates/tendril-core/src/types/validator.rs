use serde::{Deserialize, Serialize};

use crate::crypto::{merkle_root, Address, Hash, HashBuilder, PublicKey};
use crate::error::CoreError;
use crate::types::{BlockId, Commit, Height, VoteType};

/// Upper bound on a set's total power. Leaves headroom for the proposer
/// priority arithmetic in `i64`.
pub const MAX_TOTAL_VOTING_POWER: u64 = (i64::MAX / 8) as u64;

/// Whether `power` is at least two thirds of `total`.
pub fn has_quorum(power: u64, total: u64) -> bool {
    total > 0 && (power as u128) * 3 >= (total as u128) * 2
}

/// Smallest power that satisfies [`has_quorum`] for `total`.
pub fn quorum_threshold(total: u64) -> u64 {
    ((total as u128 * 2 + 2) / 3) as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub pub_key: PublicKey,
    pub voting_power: u64,
    /// Proposer priority.
    pub accum: i64,
}

impl Validator {
    pub fn new(pub_key: PublicKey, voting_power: u64) -> Self {
        Validator {
            address: pub_key.address(),
            pub_key,
            voting_power,
            accum: 0,
        }
    }

    /// Hash of the identity and power; the accumulator is excluded.
    pub fn hash(&self) -> Hash {
        HashBuilder::new("tendril/validator")
            .bytes(&self.address.0)
            .hash(&Hash(self.pub_key.0))
            .u64(self.voting_power)
            .finish()
    }
}

/// A pending validator change; power zero removes the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorUpdate {
    pub pub_key: PublicKey,
    pub power: u64,
}

/// Validators sorted by address with a cached proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    proposer: Option<Address>,
}

impl ValidatorSet {
    /// Sorts, rejects duplicates and selects the first proposer.
    pub fn new(mut validators: Vec<Validator>) -> Result<Self, CoreError> {
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        if let Some(pair) = validators.windows(2).find(|w| w[0].address == w[1].address) {
            return Err(CoreError::DuplicateValidator(pair[0].address.to_hex()));
        }

        let mut set = ValidatorSet {
            validators,
            proposer: None,
        };
        set.check_power()?;
        set.increment_accum(1);
        Ok(set)
    }

    fn check_power(&self) -> Result<(), CoreError> {
        if self.validators.is_empty() {
            return Err(CoreError::EmptyValidatorSet);
        }
        let total = self
            .validators
            .iter()
            .try_fold(0u64, |sum, v| sum.checked_add(v.voting_power));
        match total {
            Some(0) => Err(CoreError::NoVotingPower),
            Some(total) if total <= MAX_TOTAL_VOTING_POWER => Ok(()),
            _ => Err(CoreError::VotingPowerTooLarge {
                max: MAX_TOTAL_VOTING_POWER,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn total_voting_power(&self) -> u64 {
        self.validators
            .iter()
            .fold(0u64, |sum, v| sum.saturating_add(v.voting_power))
    }

    pub fn get_by_address(&self, address: &Address) -> Option<(u32, &Validator)> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
            .map(|index| (index as u32, &self.validators[index]))
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    pub fn proposer(&self) -> Option<&Validator> {
        self.proposer
            .and_then(|address| self.get_by_address(&address))
            .map(|(_, validator)| validator)
    }

    pub fn is_proposer(&self, address: &Address) -> bool {
        self.proposer.as_ref() == Some(address)
    }

    /// Advances proposer priority by `times` rounds.
    ///
    /// Every validator gains `voting_power * times`; then, `times` times, the
    /// highest priority validator is charged the total power. The last one
    /// charged becomes the proposer.
    pub fn increment_accum(&mut self, times: u32) {
        if times == 0 || self.validators.is_empty() {
            return;
        }

        let total = i64::try_from(self.total_voting_power()).unwrap_or(i64::MAX);
        for validator in &mut self.validators {
            let gain = (validator.voting_power as i64).saturating_mul(times as i64);
            validator.accum = validator.accum.saturating_add(gain);
        }

        let mut winner = None;
        for _ in 0..times {
            if let Some(index) = self.highest_accum() {
                let accum = &mut self.validators[index].accum;
                *accum = accum.saturating_sub(total);
                winner = Some(index);
            }
        }
        if let Some(index) = winner {
            self.proposer = Some(self.validators[index].address);
        }
    }

    /// Index of the highest accum among validators with power; ties go to the
    /// lower address.
    fn highest_accum(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, validator) in self.validators.iter().enumerate() {
            if validator.voting_power == 0 {
                continue;
            }
            match best {
                Some(b) if self.validators[b].accum >= validator.accum => {}
                _ => best = Some(index),
            }
        }
        best
    }

    /// Applies validator changes. The whole batch is rejected when the power
    /// it moves is one third of the current total or more.
    pub fn apply_updates(&mut self, updates: &[ValidatorUpdate]) -> Result<(), CoreError> {
        if updates.is_empty() {
            return Ok(());
        }

        let total = self.total_voting_power();
        let mut changed = 0u64;
        let mut next = self.validators.clone();

        for update in updates {
            let address = update.pub_key.address();
            match next.binary_search_by(|v| v.address.cmp(&address)) {
                Ok(index) => {
                    changed = changed.saturating_add(next[index].voting_power.abs_diff(update.power));
                    if update.power == 0 {
                        next.remove(index);
                    } else {
                        next[index].voting_power = update.power;
                    }
                }
                Err(index) => {
                    if update.power == 0 {
                        return Err(CoreError::UnknownValidator(address.to_hex()));
                    }
                    changed = changed.saturating_add(update.power);
                    next.insert(index, Validator::new(update.pub_key, update.power));
                }
            }
        }

        if (changed as u128) * 3 >= total as u128 {
            return Err(CoreError::ValidatorChangeTooLarge { changed, total });
        }

        let candidate = ValidatorSet {
            validators: next,
            proposer: None,
        };
        candidate.check_power()?;
        self.validators = candidate.validators;
        self.proposer = self.highest_accum().map(|i| self.validators[i].address);
        Ok(())
    }

    pub fn hash(&self) -> Hash {
        let hashes: Vec<Hash> = self.validators.iter().map(Validator::hash).collect();
        merkle_root(&hashes)
    }

    /// Verifies that `commit` carries a precommit quorum of this set for
    /// `block_id` at `height`.
    pub fn verify_commit(
        &self,
        chain_id: &str,
        block_id: BlockId,
        height: Height,
        commit: &Commit,
    ) -> Result<(), CoreError> {
        if commit.height != height {
            return Err(CoreError::InvalidCommit(format!(
                "wrong height: {} vs {}",
                commit.height, height
            )));
        }
        if commit.block_id != block_id {
            return Err(CoreError::InvalidCommit(format!(
                "commit is for {}, expected {}",
                commit.block_id, block_id
            )));
        }

        let power = match &commit.aggregate {
            Some(agg) => {
                if agg.height != height
                    || agg.round != commit.round
                    || agg.vote_type != VoteType::Precommit
                    || agg.block_id != block_id
                {
                    return Err(CoreError::InvalidCommit(
                        "aggregate does not match commit".into(),
                    ));
                }
                agg.verify(chain_id, self)?
            }
            None => {
                if commit.precommits.len() != self.len() {
                    return Err(CoreError::InvalidCommit(format!(
                        "wrong set size: {} vs {}",
                        commit.precommits.len(),
                        self.len()
                    )));
                }
                let mut power = 0u64;
                for (index, vote) in commit.precommits.iter().enumerate() {
                    let Some(vote) = vote else { continue };
                    if vote.height != height
                        || vote.round != commit.round
                        || vote.vote_type != VoteType::Precommit
                    {
                        return Err(CoreError::InvalidCommit(format!(
                            "unexpected vote at index {index}: {vote}"
                        )));
                    }
                    let validator = &self.validators[index];
                    vote.verify(chain_id, &validator.pub_key)?;
                    if vote.block_id == block_id {
                        power += validator.voting_power;
                    }
                }
                power
            }
        };

        let total = self.total_voting_power();
        if !has_quorum(power, total) {
            return Err(CoreError::InsufficientVotingPower {
                got: power,
                need: quorum_threshold(total),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn set_with_powers(powers: &[u64]) -> ValidatorSet {
        ValidatorSet::new(
            powers
                .iter()
                .enumerate()
                .map(|(i, p)| Validator::new(KeyPair::from_seed(i as u8 + 1).public, *p))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_quorum_threshold() {
        assert!(has_quorum(3, 4));
        assert!(!has_quorum(2, 4));
        assert!(has_quorum(2, 3));
        assert!(!has_quorum(0, 0));
        assert_eq!(quorum_threshold(4), 3);
        assert_eq!(quorum_threshold(3), 2);
        assert_eq!(quorum_threshold(100), 67);
        for total in 1..50u64 {
            let t = quorum_threshold(total);
            assert!(has_quorum(t, total));
            assert!(!has_quorum(t - 1, total));
        }
    }

    #[test]
    fn test_new_sorts_and_rejects_duplicates() {
        let set = set_with_powers(&[1, 1, 1]);
        let addrs: Vec<_> = set.validators().iter().map(|v| v.address).collect();
        let mut sorted = addrs.clone();
        sorted.sort();
        assert_eq!(addrs, sorted);

        let kp = KeyPair::from_seed(9);
        let dup = ValidatorSet::new(vec![Validator::new(kp.public, 1), Validator::new(kp.public, 2)]);
        assert_matches!(dup, Err(CoreError::DuplicateValidator(_)));
        assert_matches!(ValidatorSet::new(vec![]), Err(CoreError::EmptyValidatorSet));
        assert_matches!(
            ValidatorSet::new(vec![Validator::new(kp.public, 0)]),
            Err(CoreError::NoVotingPower)
        );
    }

    #[test]
    fn test_proposer_frequency_follows_power() {
        let mut set = set_with_powers(&[1, 2, 3]);
        let mut counts: HashMap<u64, i64> = HashMap::new();
        for _ in 0..600 {
            let proposer = set.proposer().unwrap().voting_power;
            *counts.entry(proposer).or_default() += 1;
            set.increment_accum(1);
        }
        for (power, expected) in [(1u64, 100i64), (2, 200), (3, 300)] {
            let got = counts.get(&power).copied().unwrap_or_default();
            assert!((got - expected).abs() <= 1, "power {power}: {got}");
        }
    }

    #[test]
    fn test_equal_power_round_robin() {
        let mut set = set_with_powers(&[1, 1, 1, 1]);
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(set.proposer().unwrap().address);
            set.increment_accum(1);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_zero_power_never_proposes() {
        let mut set = set_with_powers(&[0, 1, 0, 2]);
        for _ in 0..50 {
            assert!(set.proposer().unwrap().voting_power > 0);
            set.increment_accum(1);
        }
        set.increment_accum(7);
        assert!(set.proposer().unwrap().voting_power > 0);
    }

    #[test]
    fn test_accum_stays_bounded() {
        let mut set = set_with_powers(&[5, 1, 9, 3]);
        let total = set.total_voting_power() as i64;
        for round in 0..200 {
            set.increment_accum(round % 3 + 1);
            let sum: i64 = set.validators().iter().map(|v| v.accum).sum();
            assert!(sum.abs() <= total, "accum sum drifted to {sum}");
        }
    }

    #[test]
    fn test_apply_updates() {
        let mut set = set_with_powers(&[3, 3, 3, 3]);
        let newcomer = KeyPair::from_seed(50).public;
        set.apply_updates(&[ValidatorUpdate { pub_key: newcomer, power: 2 }])
            .unwrap();
        assert_eq!(set.len(), 5);
        assert!(set.has_address(&newcomer.address()));

        let removed = set.validators()[0].pub_key;
        set.apply_updates(&[ValidatorUpdate { pub_key: removed, power: 0 }])
            .unwrap();
        assert_eq!(set.len(), 4);
        assert!(!set.has_address(&removed.address()));
        assert!(set.proposer().is_some());
    }

    #[test]
    fn test_total_power_is_capped() {
        let a = KeyPair::from_seed(1).public;
        let b = KeyPair::from_seed(2).public;

        let at_cap = ValidatorSet::new(vec![
            Validator::new(a, MAX_TOTAL_VOTING_POWER - 1),
            Validator::new(b, 1),
        ])
        .unwrap();
        assert_eq!(at_cap.total_voting_power(), MAX_TOTAL_VOTING_POWER);
        let mut rotated = at_cap.clone();
        rotated.increment_accum(5);
        assert!(rotated.proposer().is_some());

        let over = ValidatorSet::new(vec![
            Validator::new(a, MAX_TOTAL_VOTING_POWER),
            Validator::new(b, 1),
        ]);
        assert_matches!(over, Err(CoreError::VotingPowerTooLarge { .. }));

        let half = i64::MAX as u64 / 2 + 10;
        let wraps = ValidatorSet::new(vec![Validator::new(a, half), Validator::new(b, half)]);
        assert_matches!(wraps, Err(CoreError::VotingPowerTooLarge { .. }));

        let overflows = ValidatorSet::new(vec![
            Validator::new(a, u64::MAX / 2 + 10),
            Validator::new(b, u64::MAX / 2 + 10),
        ]);
        assert_matches!(overflows, Err(CoreError::VotingPowerTooLarge { .. }));
    }

    #[test]
    fn test_apply_updates_respects_power_cap() {
        let big = MAX_TOTAL_VOTING_POWER / 2;
        let mut set = set_with_powers(&[big, big]);
        let before = set.clone();
        let bump = set.validators()[0].pub_key;
        let err = set.apply_updates(&[ValidatorUpdate {
            pub_key: bump,
            power: big + big / 4,
        }]);
        assert_matches!(err, Err(CoreError::VotingPowerTooLarge { .. }));
        assert_eq!(set, before);
    }

    #[test]
    fn test_apply_updates_rejects_large_change() {
        let mut set = set_with_powers(&[1, 1, 1]);
        let before = set.clone();
        let big = KeyPair::from_seed(60).public;
        let err = set.apply_updates(&[ValidatorUpdate { pub_key: big, power: 1 }]);
        assert_matches!(err, Err(CoreError::ValidatorChangeTooLarge { .. }));
        assert_eq!(set, before);

        let unknown = KeyPair::from_seed(61).public;
        let err = set.apply_updates(&[ValidatorUpdate { pub_key: unknown, power: 0 }]);
        assert_matches!(err, Err(CoreError::UnknownValidator(_)));
    }
}
