use serde::de::DeserializeOwned;
use serde::Serialize;
use tendril_core::{serialize, Commit, Height};
use tracing::{debug, warn};

use crate::error::StateError;
use crate::genesis::GenesisDoc;
use crate::state::State;
use crate::storage::Storage;

const STATE_KEY: &[u8] = b"consensus:state";
const COMMIT_PREFIX: &str = "consensus:commit:";

/// Persistence used by the consensus engine at startup and after every
/// committed block.
pub trait ConsensusStore: Send {
    /// Stores the post-commit state and the commit that finalized `height`
    /// together.
    fn save_consensus_state(
        &mut self,
        height: Height,
        state: &State,
        seen_commit: &Commit,
    ) -> Result<(), StateError>;

    fn load_state(&self) -> Result<Option<State>, StateError>;

    fn load_seen_commit(&self, height: Height) -> Result<Option<Commit>, StateError>;
}

/// Stored state, or the genesis state for a fresh store.
pub fn load_state_or_genesis(
    store: &dyn ConsensusStore,
    genesis: &GenesisDoc,
) -> Result<State, StateError> {
    match store.load_state()? {
        Some(state) => {
            if state.chain_id != genesis.chain_id {
                return Err(StateError::InvalidGenesis(format!(
                    "store belongs to chain {}",
                    state.chain_id
                )));
            }
            debug!("Loaded state at height {}", state.last_block_height);
            Ok(state)
        }
        None => State::from_genesis(genesis),
    }
}

/// [`ConsensusStore`] over any key-value [`Storage`].
#[derive(Debug, Clone)]
pub struct KvConsensusStore<S: Storage> {
    storage: S,
}

impl<S: Storage> KvConsensusStore<S> {
    pub fn new(storage: S) -> Self {
        KvConsensusStore { storage }
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    fn commit_key(height: Height) -> Vec<u8> {
        format!("{COMMIT_PREFIX}{height:020}").into_bytes()
    }

    fn read<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StateError> {
        self.storage
            .get(key)
            .map(|bytes| serialize::from_bytes(&bytes))
            .transpose()
            .map_err(|e| StateError::Serialization(e.to_string()))
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StateError> {
        serialize::to_bytes(value).map_err(|e| StateError::Serialization(e.to_string()))
    }

    /// Heights with a stored commit, ascending.
    pub fn commit_heights(&self) -> Vec<Height> {
        self.storage
            .keys_with_prefix(COMMIT_PREFIX.as_bytes())
            .iter()
            .filter_map(|key| std::str::from_utf8(&key[COMMIT_PREFIX.len()..]).ok()?.parse().ok())
            .collect()
    }
}

impl<S: Storage> ConsensusStore for KvConsensusStore<S> {
    fn save_consensus_state(
        &mut self,
        height: Height,
        state: &State,
        seen_commit: &Commit,
    ) -> Result<(), StateError> {
        if state.last_block_height != height {
            return Err(StateError::HeightMismatch {
                height,
                state: state.last_block_height,
            });
        }

        let state_bytes = Self::encode(state)?;
        let commit_bytes = Self::encode(seen_commit)?;
        self.storage.put(STATE_KEY, &state_bytes);
        self.storage.put(&Self::commit_key(height), &commit_bytes);
        if let Err(e) = self.storage.commit() {
            warn!("Failed to persist height {}: {}", height, e);
            self.storage.rollback();
            return Err(e);
        }
        Ok(())
    }

    fn load_state(&self) -> Result<Option<State>, StateError> {
        self.read(STATE_KEY)
    }

    fn load_seen_commit(&self, height: Height) -> Result<Option<Commit>, StateError> {
        self.read(&Self::commit_key(height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::genesis;
    use crate::storage::{FileStorage, MemoryStorage};
    use assert_matches::assert_matches;
    use tendril_core::{BlockId, Hash};

    fn commit_for(height: Height, block_id: BlockId) -> Commit {
        Commit {
            block_id,
            height,
            round: 0,
            precommits: vec![None; 4],
            aggregate: None,
        }
    }

    #[test]
    fn test_fresh_store_yields_genesis() {
        let store = KvConsensusStore::new(MemoryStorage::new());
        let state = load_state_or_genesis(&store, &genesis(4)).unwrap();
        assert_eq!(state.last_block_height, 0);
        assert!(store.load_seen_commit(1).unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let mut store = KvConsensusStore::new(MemoryStorage::new());
        let state = State::from_genesis(&genesis(4)).unwrap();
        let proposer = state.validators.proposer().unwrap().address;
        let block = state.make_block(0, vec![], None, proposer, 1);
        let next = state.next_state(block.id(), &block, Hash::ZERO);
        let commit = commit_for(1, block.id());

        store.save_consensus_state(1, &next, &commit).unwrap();
        assert_eq!(store.load_state().unwrap(), Some(next.clone()));
        assert_eq!(store.load_seen_commit(1).unwrap(), Some(commit.clone()));
        assert_eq!(store.commit_heights(), vec![1]);

        assert_matches!(
            store.save_consensus_state(5, &next, &commit),
            Err(StateError::HeightMismatch { height: 5, state: 1 })
        );
    }

    #[test]
    fn test_chain_id_mismatch() {
        let mut store = KvConsensusStore::new(MemoryStorage::new());
        let mut state = State::from_genesis(&genesis(4)).unwrap();
        state.last_block_height = 1;
        store
            .save_consensus_state(1, &state, &commit_for(1, BlockId::NIL))
            .unwrap();

        let mut other = genesis(4);
        other.chain_id = "other".into();
        assert_matches!(
            load_state_or_genesis(&store, &other),
            Err(StateError::InvalidGenesis(_))
        );
    }

    #[test]
    fn test_file_store_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consensus.bin");
        let mut state = State::from_genesis(&genesis(4)).unwrap();
        state.last_block_height = 1;

        let mut store = KvConsensusStore::new(FileStorage::open(&path).unwrap());
        store
            .save_consensus_state(1, &state, &commit_for(1, BlockId::new(Hash([2; 32]))))
            .unwrap();

        let reopened = KvConsensusStore::new(FileStorage::open(&path).unwrap());
        assert_eq!(reopened.load_state().unwrap(), Some(state));
        assert!(reopened.load_seen_commit(1).unwrap().is_some());
    }
}
