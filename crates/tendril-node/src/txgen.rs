use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tendril_consensus::ConsensusHandle;
use tendril_core::Tx;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::mempool::{MempoolError, TxPool};

const KEY_SPACE: u32 = 64;

/// A `key=value` transaction over a small key space, so values get
/// overwritten.
pub fn random_tx(rng: &mut impl Rng) -> Tx {
    let key = rng.gen_range(0..KEY_SPACE);
    let value: u64 = rng.gen();
    format!("key{key}={value:x}").into_bytes()
}

/// Feeds the pool one transaction per `interval` and wakes the engines.
pub fn spawn(pool: Arc<TxPool>, handles: Vec<ConsensusHandle>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match pool.add(random_tx(&mut rng)) {
                Ok(hash) => {
                    debug!("Generated tx {}", hash.short());
                    for handle in &handles {
                        handle.notify_txs_available();
                    }
                }
                Err(MempoolError::AlreadyExists) => {}
                Err(e) => warn!("Dropping generated tx: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::parse_kv;

    #[test]
    fn test_random_tx_is_key_value() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let tx = random_tx(&mut rng);
            let (key, value) = parse_kv(&tx).unwrap();
            assert!(key.starts_with(b"key"));
            assert!(!value.is_empty());
        }
    }
}
