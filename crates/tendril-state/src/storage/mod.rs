pub mod memory;
pub mod persistent;

use std::collections::{BTreeMap, BTreeSet};

use crate::error::StateError;

/// Key-value storage with explicit commit
pub trait Storage: Send + Sync {
    /// Get a value by key, pending writes included
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Stage a write
    fn put(&mut self, key: &[u8], value: &[u8]);

    /// Stage a delete
    fn delete(&mut self, key: &[u8]);

    /// Make staged writes durable
    fn commit(&mut self) -> Result<(), StateError>;

    /// Drop staged writes
    fn rollback(&mut self);

    fn exists(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Keys starting with `prefix`, sorted
    fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>>;
}

/// Committed data with a layer of staged writes on top. `None` in the
/// staged layer marks a delete.
#[derive(Debug, Clone, Default)]
pub(crate) struct Overlay {
    pub(crate) data: BTreeMap<Vec<u8>, Vec<u8>>,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Overlay {
    pub(crate) fn with_data(data: BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        Overlay {
            data,
            staged: BTreeMap::new(),
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.staged.get(key) {
            Some(staged) => staged.clone(),
            None => self.data.get(key).cloned(),
        }
    }

    pub(crate) fn stage(&mut self, key: &[u8], value: Option<&[u8]>) {
        self.staged.insert(key.to_vec(), value.map(<[u8]>::to_vec));
    }

    pub(crate) fn apply(&mut self) {
        for (key, value) in std::mem::take(&mut self.staged) {
            match value {
                Some(v) => self.data.insert(key, v),
                None => self.data.remove(&key),
            };
        }
    }

    pub(crate) fn discard(&mut self) {
        self.staged.clear();
    }

    pub(crate) fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        let mut keys: BTreeSet<Vec<u8>> = self
            .data
            .range(prefix.to_vec()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect();

        for (key, value) in self.staged.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if value.is_some() {
                keys.insert(key.clone());
            } else {
                keys.remove(key);
            }
        }

        keys.into_iter().collect()
    }
}

pub use memory::MemoryStorage;
pub use persistent::FileStorage;
