use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tendril_core::{tx_hash, Hash, Tx};
use tendril_rpc::TxSink;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("Transaction already exists in mempool")]
    AlreadyExists,

    #[error("Mempool is full")]
    PoolFull,

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<(Hash, Tx)>,
    hashes: HashSet<Hash>,
}

/// First-in first-out pool of `key=value` transactions shared by the local
/// validators.
pub struct TxPool {
    max_size: usize,
    inner: Mutex<Inner>,
}

impl TxPool {
    pub fn new(max_size: usize) -> Self {
        TxPool {
            max_size,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn add(&self, tx: Tx) -> Result<Hash, MempoolError> {
        parse_kv(&tx)?;
        let hash = tx_hash(&tx);

        let mut inner = self.inner.lock();
        if inner.hashes.contains(&hash) {
            return Err(MempoolError::AlreadyExists);
        }
        if inner.queue.len() >= self.max_size {
            return Err(MempoolError::PoolFull);
        }
        inner.hashes.insert(hash);
        inner.queue.push_back((hash, tx));

        debug!("Added transaction {} to mempool", hash);
        Ok(hash)
    }

    /// Oldest transactions first, without removing them.
    pub fn reap(&self, max_count: usize) -> Vec<Tx> {
        self.inner
            .lock()
            .queue
            .iter()
            .take(max_count)
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    pub fn remove_committed(&self, txs: &[Tx]) {
        let committed: HashSet<Hash> = txs.iter().map(|tx| tx_hash(tx)).collect();
        let mut inner = self.inner.lock();
        inner.queue.retain(|(hash, _)| !committed.contains(hash));
        inner.hashes.retain(|hash| !committed.contains(hash));
    }

    pub fn size(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl TxSink for TxPool {
    fn submit_tx(&self, tx: Tx) -> Result<(), String> {
        self.add(tx).map(|_| ()).map_err(|e| e.to_string())
    }

    fn pending(&self) -> usize {
        self.size()
    }
}

/// Splits a `key=value` transaction.
pub fn parse_kv(tx: &[u8]) -> Result<(&[u8], &[u8]), MempoolError> {
    let split = tx
        .iter()
        .position(|b| *b == b'=')
        .ok_or_else(|| MempoolError::InvalidTransaction("expected key=value".into()))?;
    let (key, value) = (&tx[..split], &tx[split + 1..]);
    if key.is_empty() {
        return Err(MempoolError::InvalidTransaction("empty key".into()));
    }
    Ok((key, value))
}
