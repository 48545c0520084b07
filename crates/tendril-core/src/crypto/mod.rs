pub mod hash;
pub mod keys;
pub mod signature;

pub use hash::{hash_blake3, merkle_root, Hash, HashBuilder};
pub use keys::{Address, KeyPair, PublicKey, SecretKey};
pub use signature::{sign, verify, Sig};
