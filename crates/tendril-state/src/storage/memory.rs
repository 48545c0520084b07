use super::{Overlay, Storage};
use crate::error::StateError;

/// In-memory storage; commits never fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Overlay,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed keys
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.get(key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.inner.stage(key, Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.inner.stage(key, None);
    }

    fn commit(&mut self) -> Result<(), StateError> {
        self.inner.apply();
        Ok(())
    }

    fn rollback(&mut self) {
        self.inner.discard();
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.inner.keys_with_prefix(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_writes_visible_before_commit() {
        let mut storage = MemoryStorage::new();
        storage.put(b"state", b"v1");
        assert_eq!(storage.get(b"state"), Some(b"v1".to_vec()));
        assert!(storage.is_empty());

        storage.rollback();
        assert_eq!(storage.get(b"state"), None);
    }

    #[test]
    fn test_delete_then_rollback() {
        let mut storage = MemoryStorage::new();
        storage.put(b"commit:1", b"c1");
        storage.commit().unwrap();

        storage.delete(b"commit:1");
        assert!(!storage.exists(b"commit:1"));
        storage.rollback();
        assert!(storage.exists(b"commit:1"));
    }

    #[test]
    fn test_prefix_merges_staged_layer() {
        let mut storage = MemoryStorage::new();
        storage.put(b"commit:1", b"a");
        storage.put(b"commit:2", b"b");
        storage.put(b"state", b"s");
        storage.commit().unwrap();

        storage.put(b"commit:3", b"c");
        storage.delete(b"commit:1");

        let keys = storage.keys_with_prefix(b"commit:");
        assert_eq!(keys, vec![b"commit:2".to_vec(), b"commit:3".to_vec()]);
        assert_eq!(storage.len(), 3);
    }
}
