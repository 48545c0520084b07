use serde::{Deserialize, Serialize};
use tendril_core::{
    Address, Block, BlockHeader, BlockId, Commit, Hash, Height, Round, Tx, ValidatorSet,
};
use tracing::debug;

use crate::error::StateError;
use crate::genesis::GenesisDoc;

/// Chain state after the last committed block; the input for deciding and
/// validating the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub chain_id: String,
    pub last_block_height: Height,
    pub last_block_total_tx: u64,
    pub last_block_id: BlockId,
    /// Unix milliseconds
    pub last_block_time: u64,
    /// Validators for the next height.
    pub validators: ValidatorSet,
    /// Validators that signed the last block.
    pub last_validators: ValidatorSet,
    pub last_height_validators_changed: Height,
    pub app_hash: Hash,
    pub last_commit_round: Round,
}

impl State {
    pub fn from_genesis(genesis: &GenesisDoc) -> Result<Self, StateError> {
        genesis.validate()?;
        let validators = genesis.validator_set()?;

        Ok(State {
            chain_id: genesis.chain_id.clone(),
            last_block_height: 0,
            last_block_total_tx: 0,
            last_block_id: BlockId::NIL,
            last_block_time: genesis.genesis_time,
            last_validators: validators.clone(),
            validators,
            last_height_validators_changed: 1,
            app_hash: genesis.app_hash,
            last_commit_round: 0,
        })
    }

    pub fn next_height(&self) -> Height {
        self.last_block_height + 1
    }

    /// Assembles a block on top of this state.
    pub fn make_block(
        &self,
        round: Round,
        txs: Vec<Tx>,
        last_commit: Option<Commit>,
        proposer: Address,
        time: u64,
    ) -> Block {
        let num_txs = txs.len() as u64;
        let header = BlockHeader {
            chain_id: self.chain_id.clone(),
            height: self.next_height(),
            round,
            time,
            num_txs,
            total_txs: self.last_block_total_tx + num_txs,
            last_block_id: self.last_block_id,
            last_commit_hash: last_commit.as_ref().map(Commit::hash).unwrap_or(Hash::ZERO),
            data_hash: Block::compute_data_hash(&txs),
            validators_hash: self.validators.hash(),
            app_hash: self.app_hash,
            proposer_address: proposer,
        };
        Block {
            header,
            txs,
            last_commit,
        }
    }

    /// State after committing `block` with the resulting `app_hash`.
    /// Proposer priority advances by one round.
    pub fn next_state(&self, block_id: BlockId, block: &Block, app_hash: Hash) -> State {
        let mut validators = self.validators.clone();
        validators.increment_accum(1);

        State {
            chain_id: self.chain_id.clone(),
            last_block_height: block.header.height,
            last_block_total_tx: block.header.total_txs,
            last_block_id: block_id,
            last_block_time: block.header.time,
            validators,
            last_validators: self.validators.clone(),
            last_height_validators_changed: self.last_height_validators_changed,
            app_hash,
            last_commit_round: block.header.round,
        }
    }

    /// Checks `block` against this state, including the commit it carries
    /// for the previous height.
    pub fn validate_block(&self, block: &Block) -> Result<(), StateError> {
        let header = &block.header;
        let invalid = |msg: String| Err(StateError::InvalidBlock(msg));

        if header.chain_id != self.chain_id {
            return invalid(format!("wrong chain id {}", header.chain_id));
        }
        if header.height != self.next_height() {
            return invalid(format!(
                "wrong height {}, expected {}",
                header.height,
                self.next_height()
            ));
        }
        if header.last_block_id != self.last_block_id {
            return invalid(format!("wrong last block id {}", header.last_block_id));
        }
        if header.num_txs != block.txs.len() as u64 {
            return invalid(format!("num_txs {} for {} txs", header.num_txs, block.txs.len()));
        }
        if header.total_txs != self.last_block_total_tx + header.num_txs {
            return invalid(format!("wrong total_txs {}", header.total_txs));
        }
        if !block.verify_data_hash() {
            return invalid("data hash mismatch".into());
        }
        if header.validators_hash != self.validators.hash() {
            return invalid("validators hash mismatch".into());
        }
        if header.app_hash != self.app_hash {
            return invalid(format!("wrong app hash {}", header.app_hash.short()));
        }
        if !self.validators.has_address(&header.proposer_address) {
            return invalid(format!("proposer {} is not a validator", header.proposer_address));
        }

        match (&block.last_commit, header.height) {
            (None, 1) => {}
            (Some(_), 1) => return invalid("block at height 1 carries a last commit".into()),
            (None, _) => return invalid("missing last commit".into()),
            (Some(commit), height) => {
                if header.last_commit_hash != commit.hash() {
                    return invalid("last commit hash mismatch".into());
                }
                self.last_validators.verify_commit(
                    &self.chain_id,
                    self.last_block_id,
                    height - 1,
                    commit,
                )?;
            }
        }

        debug!("Block {} at height {} is valid", block.hash().short(), header.height);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::genesis::GenesisValidator;
    use assert_matches::assert_matches;
    use tendril_core::KeyPair;

    pub(crate) fn genesis(n: u8) -> GenesisDoc {
        GenesisDoc {
            chain_id: "tendril-test".into(),
            genesis_time: 1_700_000_000_000,
            validators: (1..=n)
                .map(|i| GenesisValidator {
                    pub_key: KeyPair::from_seed(i).public,
                    power: 10,
                    name: format!("val{i}"),
                })
                .collect(),
            app_hash: Hash::ZERO,
        }
    }

    #[test]
    fn test_genesis_state() {
        let state = State::from_genesis(&genesis(4)).unwrap();
        assert_eq!(state.next_height(), 1);
        assert_eq!(state.validators.len(), 4);
        assert_eq!(state.validators.total_voting_power(), 40);
        assert!(state.last_block_id.is_nil());
    }

    #[test]
    fn test_genesis_rejects_zero_power() {
        let mut doc = genesis(2);
        doc.validators[0].power = 0;
        assert_matches!(State::from_genesis(&doc), Err(StateError::InvalidGenesis(_)));
    }

    #[test]
    fn test_genesis_rejects_oversized_power() {
        let mut doc = genesis(2);
        for v in &mut doc.validators {
            v.power = i64::MAX as u64 / 2 + 10;
        }
        assert!(doc.validate().is_err());
        assert!(State::from_genesis(&doc).is_err());
    }

    #[test]
    fn test_make_block_validates() {
        let state = State::from_genesis(&genesis(4)).unwrap();
        let proposer = state.validators.proposer().unwrap().address;
        let block = state.make_block(0, vec![b"k=v".to_vec()], None, proposer, 1);
        assert!(state.validate_block(&block).is_ok());

        let mut wrong_height = block.clone();
        wrong_height.header.height = 2;
        assert_matches!(state.validate_block(&wrong_height), Err(StateError::InvalidBlock(_)));

        let mut extra_tx = block.clone();
        extra_tx.txs.push(b"x".to_vec());
        assert!(state.validate_block(&extra_tx).is_err());

        let mut stranger = block;
        stranger.header.proposer_address = KeyPair::from_seed(99).address();
        assert!(state.validate_block(&stranger).is_err());
    }

    #[test]
    fn test_next_state_rotates_validators() {
        let state = State::from_genesis(&genesis(4)).unwrap();
        let proposer = state.validators.proposer().unwrap().address;
        let block = state.make_block(0, vec![], None, proposer, 5);
        let next = state.next_state(block.id(), &block, Hash([1; 32]));

        assert_eq!(next.last_block_height, 1);
        assert_eq!(next.last_block_id, block.id());
        assert_eq!(next.last_validators, state.validators);
        assert_ne!(next.validators.proposer().unwrap().address, proposer);
        assert_eq!(next.app_hash, Hash([1; 32]));

        let second = next.make_block(0, vec![], None, proposer, 6);
        assert_matches!(next.validate_block(&second), Err(StateError::InvalidBlock(_)));
    }
}
