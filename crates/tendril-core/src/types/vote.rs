use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{sign, verify, Address, Hash, HashBuilder, PublicKey, SecretKey, Sig};
use crate::error::CoreError;
use crate::serialize;
use crate::types::{BitArray, BlockId, Height, Round, ValidatorSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => f.write_str("Prevote"),
            VoteType::Precommit => f.write_str("Precommit"),
        }
    }
}

#[derive(Serialize)]
struct CanonicalVote<'a> {
    chain_id: &'a str,
    vote_type: VoteType,
    height: Height,
    round: Round,
    block_id: BlockId,
    timestamp: u64,
}

fn canonical_vote_bytes(
    chain_id: &str,
    vote_type: VoteType,
    height: Height,
    round: Round,
    block_id: BlockId,
    timestamp: u64,
) -> Result<Vec<u8>, CoreError> {
    serialize::to_bytes(&CanonicalVote {
        chain_id,
        vote_type,
        height,
        round,
        block_id,
        timestamp,
    })
}

/// A signed prevote or precommit from one validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: Height,
    pub round: Round,
    pub block_id: BlockId,
    pub validator_address: Address,
    pub validator_index: u32,
    /// Unix milliseconds. Not part of the sign bytes in aggregate mode.
    pub timestamp: u64,
    /// Signed for aggregation by the round proposer.
    pub use_agg_sig: bool,
    pub signature: Sig,
}

impl Vote {
    pub fn sign_bytes(&self, chain_id: &str) -> Result<Vec<u8>, CoreError> {
        let timestamp = if self.use_agg_sig { 0 } else { self.timestamp };
        canonical_vote_bytes(
            chain_id,
            self.vote_type,
            self.height,
            self.round,
            self.block_id,
            timestamp,
        )
    }

    pub fn sign(&mut self, chain_id: &str, key: &SecretKey) -> Result<(), CoreError> {
        self.signature = sign(key, &self.sign_bytes(chain_id)?);
        Ok(())
    }

    pub fn verify(&self, chain_id: &str, key: &PublicKey) -> Result<(), CoreError> {
        if key.address() != self.validator_address {
            return Err(CoreError::InvalidAddress);
        }
        verify(key, &self.sign_bytes(chain_id)?, &self.signature)
    }

    pub fn hash(&self) -> Hash {
        HashBuilder::new("tendril/vote")
            .u64(self.vote_type as u64)
            .u64(self.height)
            .u64(self.round as u64)
            .opt_hash(self.block_id.hash.as_ref())
            .bytes(&self.validator_address.0)
            .u64(self.validator_index as u64)
            .u64(self.timestamp)
            .bytes(self.signature.as_bytes())
            .finish()
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vote{{{}:{} {}/{} {} {}}}",
            self.validator_index,
            self.validator_address,
            self.height,
            self.round,
            self.vote_type,
            self.block_id
        )
    }
}

/// Member signatures of an aggregate vote, ordered by the set bits of the
/// validator bitmap. Ed25519 has no native aggregation, so the aggregate is
/// the concatenation of member signatures over identical sign bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregateSignature(pub Vec<Sig>);

/// A whole quorum for one (height, round, type) in a single message,
/// assembled by the round proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateVote {
    pub vote_type: VoteType,
    pub height: Height,
    pub round: Round,
    pub block_id: BlockId,
    pub aggregator: Address,
    pub validator_array: BitArray,
    pub signature: AggregateSignature,
}

impl AggregateVote {
    pub fn sign_bytes(&self, chain_id: &str) -> Result<Vec<u8>, CoreError> {
        canonical_vote_bytes(
            chain_id,
            self.vote_type,
            self.height,
            self.round,
            self.block_id,
            0,
        )
    }

    /// Checks every member signature and returns the covered voting power.
    pub fn verify(&self, chain_id: &str, validators: &ValidatorSet) -> Result<u64, CoreError> {
        if self.validator_array.len() != validators.len() {
            return Err(CoreError::InvalidAggregate(format!(
                "bitmap size {} for {} validators",
                self.validator_array.len(),
                validators.len()
            )));
        }
        let members = self.validator_array.count_ones();
        if members == 0 {
            return Err(CoreError::InvalidAggregate("empty bitmap".into()));
        }
        if members != self.signature.0.len() {
            return Err(CoreError::InvalidAggregate(format!(
                "{} members but {} signatures",
                members,
                self.signature.0.len()
            )));
        }

        let sign_bytes = self.sign_bytes(chain_id)?;
        let mut power = 0u64;
        for (index, sig) in self.validator_array.ones().zip(self.signature.0.iter()) {
            let validator = validators
                .get_by_index(index as u32)
                .ok_or_else(|| CoreError::InvalidAggregate(format!("no validator {index}")))?;
            verify(&validator.pub_key, &sign_bytes, sig)?;
            power += validator.voting_power;
        }
        Ok(power)
    }

    pub fn hash(&self) -> Hash {
        let mut builder = HashBuilder::new("tendril/aggregate-vote");
        builder
            .u64(self.vote_type as u64)
            .u64(self.height)
            .u64(self.round as u64)
            .opt_hash(self.block_id.hash.as_ref())
            .bytes(&self.aggregator.0);
        for index in self.validator_array.ones() {
            builder.u64(index as u64);
        }
        for sig in &self.signature.0 {
            builder.bytes(sig.as_bytes());
        }
        builder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn prevote(kp: &KeyPair, timestamp: u64, use_agg_sig: bool) -> Vote {
        Vote {
            vote_type: VoteType::Prevote,
            height: 3,
            round: 1,
            block_id: BlockId::new(Hash([1; 32])),
            validator_address: kp.address(),
            validator_index: 0,
            timestamp,
            use_agg_sig,
            signature: Sig::default(),
        }
    }

    #[test]
    fn test_vote_sign_and_verify() {
        let kp = KeyPair::from_seed(1);
        let mut vote = prevote(&kp, 10, false);
        vote.sign("chain", &kp.secret).unwrap();
        assert!(vote.verify("chain", &kp.public).is_ok());
        assert!(vote.verify("other-chain", &kp.public).is_err());
        assert!(vote.verify("chain", &KeyPair::from_seed(2).public).is_err());
    }

    #[test]
    fn test_timestamp_ignored_in_aggregate_mode() {
        let kp = KeyPair::from_seed(1);
        let a = prevote(&kp, 10, true);
        let b = prevote(&kp, 99, true);
        assert_eq!(a.sign_bytes("c").unwrap(), b.sign_bytes("c").unwrap());

        let c = prevote(&kp, 10, false);
        let d = prevote(&kp, 99, false);
        assert_ne!(c.sign_bytes("c").unwrap(), d.sign_bytes("c").unwrap());
    }

    #[test]
    fn test_aggregate_verify() {
        let keys: Vec<KeyPair> = (1..=4).map(KeyPair::from_seed).collect();
        let validators = ValidatorSet::new(
            keys.iter()
                .map(|k| crate::types::Validator::new(k.public, 1))
                .collect(),
        )
        .unwrap();

        let mut agg = AggregateVote {
            vote_type: VoteType::Precommit,
            height: 3,
            round: 0,
            block_id: BlockId::new(Hash([5; 32])),
            aggregator: keys[0].address(),
            validator_array: BitArray::new(4),
            signature: AggregateSignature::default(),
        };
        let sign_bytes = agg.sign_bytes("chain").unwrap();
        for index in 0..3u32 {
            let val = validators.get_by_index(index).unwrap();
            let key = keys.iter().find(|k| k.public == val.pub_key).unwrap();
            agg.validator_array.set(index as usize, true);
            agg.signature.0.push(sign(&key.secret, &sign_bytes));
        }

        assert_eq!(agg.verify("chain", &validators).unwrap(), 3);

        agg.signature.0.swap(0, 1);
        assert!(agg.verify("chain", &validators).is_err());
        agg.signature.0.pop();
        assert!(agg.verify("chain", &validators).is_err());
    }
}
