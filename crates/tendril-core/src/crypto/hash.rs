use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte Blake3 hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = slice.try_into().ok()?;
        Some(Hash(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First six bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute Blake3 hash of data
pub fn hash_blake3(data: &[u8]) -> Hash {
    Hash(*blake3::hash(data).as_bytes())
}

/// Incremental hasher for structures whose hash must not depend on a
/// serializer. Every variable-length field is length-prefixed.
pub struct HashBuilder {
    inner: blake3::Hasher,
}

impl HashBuilder {
    pub fn new(domain: &str) -> Self {
        let mut builder = HashBuilder {
            inner: blake3::Hasher::new(),
        };
        builder.bytes(domain.as_bytes());
        builder
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.inner.update(&value.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.u64(value.len() as u64);
        self.inner.update(value);
        self
    }

    pub fn hash(&mut self, value: &Hash) -> &mut Self {
        self.inner.update(&value.0);
        self
    }

    pub fn opt_hash(&mut self, value: Option<&Hash>) -> &mut Self {
        match value {
            Some(h) => {
                self.inner.update(&[1]);
                self.hash(h)
            }
            None => {
                self.inner.update(&[0]);
                self
            }
        }
    }

    pub fn finish(&self) -> Hash {
        Hash(*self.inner.finalize().as_bytes())
    }
}

/// Compute merkle root from a list of hashes.
/// An odd node at any level is paired with itself.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return Hash::ZERO;
    }

    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                let mut data = [0u8; 64];
                data[..32].copy_from_slice(&pair[0].0);
                data[32..].copy_from_slice(&right.0);
                hash_blake3(&data)
            })
            .collect();
    }

    level[0]
}
