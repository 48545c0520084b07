use std::sync::Arc;

use tendril_consensus::{BlockExecutor, ExecutorError};
use tendril_core::{now_millis, Address, Block, BlockId, Commit, Hash, HashBuilder, Round};
use tendril_state::{State, Storage};
use tracing::{debug, info};

use crate::mempool::{parse_kv, TxPool};

const KV_PREFIX: &[u8] = b"kv/";

/// Applies `key=value` transactions to a key-value store. The app hash
/// covers every stored pair.
pub struct KvExecutor<S: Storage> {
    storage: S,
    pool: Arc<TxPool>,
    max_block_txs: usize,
}

impl<S: Storage> KvExecutor<S> {
    pub fn new(storage: S, pool: Arc<TxPool>, max_block_txs: usize) -> Self {
        KvExecutor {
            storage,
            pool,
            max_block_txs,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.storage.get(&kv_key(key))
    }

    pub fn app_hash(&self) -> Hash {
        let mut builder = HashBuilder::new("tendril/kv");
        for key in self.storage.keys_with_prefix(KV_PREFIX) {
            let value = self.storage.get(&key).unwrap_or_default();
            builder.bytes(&key).bytes(&value);
        }
        builder.finish()
    }
}

impl<S: Storage> BlockExecutor for KvExecutor<S> {
    fn create_proposal_block(
        &mut self,
        state: &State,
        round: Round,
        last_commit: Option<Commit>,
        proposer: Address,
    ) -> Result<Block, ExecutorError> {
        let txs = self.pool.reap(self.max_block_txs);
        let time = now_millis().max(state.last_block_time + 1);
        Ok(state.make_block(round, txs, last_commit, proposer, time))
    }

    fn validate_block(&self, state: &State, block: &Block) -> Result<(), ExecutorError> {
        state.validate_block(block)?;
        if block.txs.len() > self.max_block_txs {
            return Err(ExecutorError::InvalidBlock(format!(
                "{} txs exceed the limit of {}",
                block.txs.len(),
                self.max_block_txs
            )));
        }
        for tx in &block.txs {
            parse_kv(tx).map_err(|e| ExecutorError::InvalidBlock(e.to_string()))?;
        }
        Ok(())
    }

    fn apply_block(
        &mut self,
        state: &State,
        block_id: BlockId,
        block: &Block,
    ) -> Result<State, ExecutorError> {
        if state.app_hash != self.app_hash() {
            return Err(ExecutorError::Application(format!(
                "store at height {} does not match app hash {}",
                state.last_block_height, state.app_hash
            )));
        }

        for tx in &block.txs {
            let (key, value) =
                parse_kv(tx).map_err(|e| ExecutorError::InvalidBlock(e.to_string()))?;
            self.storage.put(&kv_key(key), value);
        }
        let app_hash = self.app_hash();
        if let Err(e) = self.storage.commit() {
            self.storage.rollback();
            return Err(e.into());
        }
        self.pool.remove_committed(&block.txs);

        if block.txs.is_empty() {
            debug!("Applied empty block {}", block.header.height);
        } else {
            info!(
                "Applied block {} with {} txs, app hash {}",
                block.header.height,
                block.txs.len(),
                app_hash.short()
            );
        }
        Ok(state.next_state(block_id, block, app_hash))
    }

    fn txs_available(&self) -> bool {
        !self.pool.is_empty()
    }
}

fn kv_key(key: &[u8]) -> Vec<u8> {
    [KV_PREFIX, key].concat()
}

/// App hash of an empty store.
pub fn empty_app_hash() -> Hash {
    HashBuilder::new("tendril/kv").finish()
}
