use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{hash_blake3, merkle_root, Address, Hash, HashBuilder};
use crate::types::{AggregateVote, BitArray, Height, Round, Vote};

/// Opaque transaction bytes; the consensus layer never looks inside.
pub type Tx = Vec<u8>;

pub fn tx_hash(tx: &[u8]) -> Hash {
    hash_blake3(tx)
}

/// Identifies a candidate block. `None` is the nil vote.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: Option<Hash>,
}

impl BlockId {
    pub const NIL: BlockId = BlockId { hash: None };

    pub fn new(hash: Hash) -> Self {
        BlockId { hash: Some(hash) }
    }

    pub fn is_nil(&self) -> bool {
        self.hash.is_none()
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({self})")
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hash {
            Some(hash) => f.write_str(&hash.short()),
            None => f.write_str("nil"),
        }
    }
}

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub chain_id: String,
    pub height: Height,
    pub round: Round,
    /// Unix milliseconds
    pub time: u64,
    pub num_txs: u64,
    pub total_txs: u64,
    pub last_block_id: BlockId,
    pub last_commit_hash: Hash,
    /// Merkle root of transaction hashes
    pub data_hash: Hash,
    pub validators_hash: Hash,
    /// Application state after the previous block
    pub app_hash: Hash,
    pub proposer_address: Address,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        HashBuilder::new("tendril/header")
            .bytes(self.chain_id.as_bytes())
            .u64(self.height)
            .u64(self.round as u64)
            .u64(self.time)
            .u64(self.num_txs)
            .u64(self.total_txs)
            .opt_hash(self.last_block_id.hash.as_ref())
            .hash(&self.last_commit_hash)
            .hash(&self.data_hash)
            .hash(&self.validators_hash)
            .hash(&self.app_hash)
            .bytes(&self.proposer_address.0)
            .finish()
    }
}

/// A complete block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Tx>,
    /// Commit for the previous height; absent at height 1.
    pub last_commit: Option<Commit>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn id(&self) -> BlockId {
        BlockId::new(self.hash())
    }

    pub fn hashes_to(&self, hash: &Hash) -> bool {
        self.hash() == *hash
    }

    pub fn compute_data_hash(txs: &[Tx]) -> Hash {
        let hashes: Vec<Hash> = txs.iter().map(|tx| tx_hash(tx)).collect();
        merkle_root(&hashes)
    }

    pub fn verify_data_hash(&self) -> bool {
        Self::compute_data_hash(&self.txs) == self.header.data_hash
    }
}

/// A precommit quorum for one block, either as individual votes indexed by
/// validator position or as one aggregate vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub block_id: BlockId,
    pub height: Height,
    pub round: Round,
    pub precommits: Vec<Option<Vote>>,
    pub aggregate: Option<AggregateVote>,
}

impl Commit {
    pub fn size(&self) -> usize {
        match &self.aggregate {
            Some(agg) => agg.validator_array.len(),
            None => self.precommits.len(),
        }
    }

    pub fn bit_array(&self) -> BitArray {
        if let Some(agg) = &self.aggregate {
            return agg.validator_array.clone();
        }
        let mut bits = BitArray::new(self.precommits.len());
        for (index, vote) in self.precommits.iter().enumerate() {
            bits.set(index, vote.is_some());
        }
        bits
    }

    pub fn hash(&self) -> Hash {
        if let Some(agg) = &self.aggregate {
            return agg.hash();
        }
        let hashes: Vec<Hash> = self
            .precommits
            .iter()
            .map(|vote| vote.as_ref().map(Vote::hash).unwrap_or(Hash::ZERO))
            .collect();
        merkle_root(&hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyPair, Sig};
    use crate::types::{Validator, ValidatorSet, VoteType};

    fn header() -> BlockHeader {
        BlockHeader {
            chain_id: "test-chain".into(),
            height: 1,
            round: 0,
            time: 1_000,
            num_txs: 0,
            total_txs: 0,
            last_block_id: BlockId::NIL,
            last_commit_hash: Hash::ZERO,
            data_hash: Block::compute_data_hash(&[]),
            validators_hash: Hash::ZERO,
            app_hash: Hash::ZERO,
            proposer_address: Address::default(),
        }
    }

    #[test]
    fn test_block_hash_covers_header() {
        let block = Block {
            header: header(),
            txs: vec![],
            last_commit: None,
        };
        let mut other = block.clone();
        other.header.round = 1;
        assert_ne!(block.hash(), other.hash());
        assert!(block.hashes_to(&block.hash()));
        assert_eq!(block.id(), BlockId::new(block.hash()));
    }

    #[test]
    fn test_data_hash() {
        let txs = vec![b"a=1".to_vec(), b"b=2".to_vec()];
        let mut h = header();
        h.data_hash = Block::compute_data_hash(&txs);
        let mut block = Block {
            header: h,
            txs,
            last_commit: None,
        };
        assert!(block.verify_data_hash());
        block.txs.push(b"c=3".to_vec());
        assert!(!block.verify_data_hash());
    }

    #[test]
    fn test_verify_commit() {
        let keys: Vec<KeyPair> = (1..=4).map(KeyPair::from_seed).collect();
        let set = ValidatorSet::new(keys.iter().map(|k| Validator::new(k.public, 1)).collect())
            .unwrap();
        let block_id = BlockId::new(Hash([4; 32]));

        let mut precommits = vec![None; 4];
        for (index, validator) in set.validators().iter().enumerate().take(3) {
            let key = keys.iter().find(|k| k.public == validator.pub_key).unwrap();
            let mut vote = Vote {
                vote_type: VoteType::Precommit,
                height: 2,
                round: 0,
                block_id,
                validator_address: validator.address,
                validator_index: index as u32,
                timestamp: 5,
                use_agg_sig: false,
                signature: Sig::default(),
            };
            vote.sign("c", &key.secret).unwrap();
            precommits[index] = Some(vote);
        }

        let mut commit = Commit {
            block_id,
            height: 2,
            round: 0,
            precommits,
            aggregate: None,
        };
        assert!(set.verify_commit("c", block_id, 2, &commit).is_ok());
        assert!(set.verify_commit("c", block_id, 3, &commit).is_err());
        assert_eq!(commit.bit_array().count_ones(), 3);

        commit.precommits[2] = None;
        assert!(set.verify_commit("c", block_id, 2, &commit).is_err());
    }
}
