//! Tendril Core - Core types, cryptography, and serialization
//!
//! Hashes, ed25519 keys, validator sets with proposer rotation, votes,
//! proposals, blocks and commits shared by the consensus crates.

pub mod crypto;
pub mod error;
pub mod serialize;
pub mod types;

pub use crypto::{
    hash_blake3, merkle_root, sign, verify, Address, Hash, HashBuilder, KeyPair, PublicKey,
    SecretKey, Sig,
};
pub use error::CoreError;
pub use types::*;
