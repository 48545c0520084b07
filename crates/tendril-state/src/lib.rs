//! Tendril State - Chain state and storage
//!
//! This crate provides the consensus `State` snapshot, genesis handling,
//! key-value storage backends and consensus persistence.

pub mod error;
pub mod genesis;
pub mod state;
pub mod storage;
pub mod store;

pub use error::StateError;
pub use genesis::{GenesisDoc, GenesisValidator};
pub use state::State;
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use store::{load_state_or_genesis, ConsensusStore, KvConsensusStore};
