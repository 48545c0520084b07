use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tendril_consensus::{ConsensusEngine, ConsensusError, ConsensusHandle, LocalSigner};
use tendril_core::KeyPair;
use tendril_rpc::{RpcConfig, RpcServer};
use tendril_state::{load_state_or_genesis, FileStorage, GenesisDoc, KvConsensusStore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::executor::KvExecutor;
use crate::mempool::TxPool;
use crate::network::LocalNetwork;
use crate::txgen;

/// The Tendril node: every configured validator runs its own engine in
/// this process.
pub struct Node {
    config: NodeConfig,
    genesis: GenesisDoc,
    keys: Vec<KeyPair>,
    pool: Arc<TxPool>,
}

/// Running engines and their routers.
pub struct Devnet {
    handles: Vec<ConsensusHandle>,
    engines: JoinSet<Result<(), ConsensusError>>,
    routers: Vec<JoinHandle<()>>,
}

impl Node {
    /// Create a new node from configuration
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let genesis = config.genesis_doc()?;
        let keys = config.validator_keypairs()?;
        if keys.is_empty() {
            return Err(anyhow!("no validator keys configured"));
        }
        for key in &keys {
            if !genesis.validators.iter().any(|v| v.pub_key == key.public) {
                warn!("Key {} is not a genesis validator", key.address());
            }
        }
        let pool = Arc::new(TxPool::new(config.mempool_max_size));

        Ok(Node {
            config,
            genesis,
            keys,
            pool,
        })
    }

    pub fn pool(&self) -> Arc<TxPool> {
        Arc::clone(&self.pool)
    }

    /// Opens each validator's stores under the data dir and spawns its
    /// engine.
    pub fn start(&self) -> Result<Devnet> {
        let mut handles = Vec::with_capacity(self.keys.len());
        let mut outboxes = Vec::with_capacity(self.keys.len());
        let mut engines = JoinSet::new();

        for (i, key) in self.keys.iter().enumerate() {
            let dir = self.config.data_dir.join(format!("validator-{i}"));
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;

            let store = KvConsensusStore::new(FileStorage::open(dir.join("consensus.db"))?);
            let state = load_state_or_genesis(&store, &self.genesis)?;
            let executor = KvExecutor::new(
                FileStorage::open(dir.join("app.db"))?,
                self.pool(),
                self.config.consensus.max_block_txs,
            );
            let signer = LocalSigner::with_state_file(key.secret.clone(), dir.join("signer.json"))?;

            info!(
                "Validator {} ({}) resumes at height {}",
                i,
                key.address(),
                state.next_height()
            );
            let (engine, handle, outbox) =
                ConsensusEngine::builder(self.config.consensus.clone(), state, executor, store)
                    .signer(signer)
                    .build()?;

            outboxes.push((handle.our_id().clone(), outbox));
            handles.push(handle);
            engines.spawn(engine.run());
        }

        let network = LocalNetwork::new(&handles);
        info!("Local network with {} validators", network.len());
        let routers = outboxes
            .into_iter()
            .map(|(id, outbox)| network.spawn_router(id, outbox))
            .collect();

        Ok(Devnet {
            handles,
            engines,
            routers,
        })
    }

    /// Run the node until interrupted or an engine halts
    pub async fn run(self) -> Result<()> {
        info!("Starting Tendril node for chain {}", self.genesis.chain_id);
        let mut devnet = self.start()?;

        let rpc_config = RpcConfig {
            http_addr: self.config.rpc_addr,
        };
        let rpc_server = RpcServer::new(rpc_config, devnet.handles[0].clone())
            .with_mempool(self.pool());
        let mut rpc_task = tokio::spawn(rpc_server.run());

        let txgen_task = (self.config.txgen_interval_ms > 0).then(|| {
            txgen::spawn(
                self.pool(),
                devnet.handles.clone(),
                Duration::from_millis(self.config.txgen_interval_ms),
            )
        });

        let result = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                Ok(())
            }
            Some(joined) = devnet.engines.join_next() => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("Consensus engine halted: {}", e);
                    Err(anyhow!(e))
                }
                Err(e) => Err(anyhow!("consensus task failed: {}", e)),
            },
            joined = &mut rpc_task => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow!("RPC server error: {}", e)),
                Err(e) => Err(anyhow!("RPC task failed: {}", e)),
            },
        };

        if let Some(task) = txgen_task {
            task.abort();
        }
        rpc_task.abort();
        devnet.shutdown().await;
        result
    }
}

impl Devnet {
    pub fn handles(&self) -> &[ConsensusHandle] {
        &self.handles
    }

    /// Stops every engine, waits for them to exit and drops the routers.
    pub async fn shutdown(mut self) {
        for handle in &self.handles {
            handle.stop();
        }
        while let Some(joined) = self.engines.join_next().await {
            match joined {
                Ok(Err(e)) => warn!("Engine stopped with error: {}", e),
                Err(e) => warn!("Engine task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        // Handles keep the outboxes open, so routers never drain on their own.
        for router in self.routers {
            router.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::generate_devnet_config;
    use tendril_core::Height;

    fn devnet_config(dir: &std::path::Path, validators: usize) -> NodeConfig {
        let mut config = generate_devnet_config(validators, dir.to_path_buf());
        config.consensus.timeout_commit_ms = 50;
        config.txgen_interval_ms = 0;
        config
    }

    async fn wait_all(devnet: &Devnet, height: Height) {
        for _ in 0..2000 {
            if devnet
                .handles()
                .iter()
                .all(|h| h.get_state().last_block_height >= height)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("height {height} not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_devnet_commits_pool_txs() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(devnet_config(dir.path(), 4)).unwrap();
        let pool = node.pool();
        pool.add(b"alice=1".to_vec()).unwrap();
        pool.add(b"bob=2".to_vec()).unwrap();

        let devnet = node.start().unwrap();
        wait_all(&devnet, 3).await;

        for height in 1..=3 {
            let commits: Vec<_> = devnet
                .handles()
                .iter()
                .map(|h| h.load_commit(height).unwrap().block_id)
                .collect();
            assert!(commits.windows(2).all(|w| w[0] == w[1]), "fork at {height}");
        }
        assert!(pool.is_empty());
        devnet.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_devnet_restarts_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = devnet_config(dir.path(), 1);

        let node = Node::new(config.clone()).unwrap();
        let devnet = node.start().unwrap();
        wait_all(&devnet, 2).await;
        devnet.shutdown().await;

        let node = Node::new(config).unwrap();
        let devnet = node.start().unwrap();
        let handle = &devnet.handles()[0];
        let resumed = handle.get_state().last_block_height;
        assert!(resumed >= 2);
        assert_eq!(handle.get_round_state().height, resumed + 1);
        assert!(handle.load_commit(resumed).is_some());
        devnet.shutdown().await;
    }

    #[test]
    fn test_node_requires_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = devnet_config(dir.path(), 1);
        config.validator_keys.clear();
        assert!(Node::new(config).is_err());
    }
}
