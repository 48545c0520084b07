use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tendril_consensus::ConsensusConfig;
use tendril_core::{now_millis, KeyPair, PublicKey, SecretKey};
use tendril_state::{GenesisDoc, GenesisValidator};

use crate::executor::empty_app_hash;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node data directory
    pub data_dir: PathBuf,

    /// RPC bind address, served for the first local validator
    pub rpc_addr: SocketAddr,

    /// Consensus timeouts and modes
    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// Mempool max size
    pub mempool_max_size: usize,

    /// Genesis configuration
    pub genesis: GenesisConfigFile,

    /// Secret keys (hex) of the validators run by this process
    pub validator_keys: Vec<String>,

    /// Interval of generated transactions; zero disables the generator
    #[serde(default)]
    pub txgen_interval_ms: u64,
}

/// Genesis configuration for file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfigFile {
    pub chain_id: String,
    /// Unix milliseconds
    pub genesis_time: u64,
    pub validators: Vec<GenesisValidatorEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisValidatorEntry {
    pub pub_key: String,
    pub power: u64,
    #[serde(default)]
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: PathBuf::from("./tendril-data"),
            rpc_addr: SocketAddr::from(([127, 0, 0, 1], 26657)),
            consensus: ConsensusConfig::default(),
            mempool_max_size: 10_000,
            genesis: GenesisConfigFile {
                chain_id: "tendril-devnet".to_string(),
                genesis_time: 0,
                validators: Vec::new(),
            },
            validator_keys: Vec::new(),
            txgen_interval_ms: 0,
        }
    }
}

impl NodeConfig {
    /// Load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.consensus
            .validate()
            .map_err(|e| anyhow!("invalid consensus config: {}", e))?;
        if self.genesis.validators.is_empty() {
            return Err(anyhow!("genesis has no validators"));
        }
        if self.mempool_max_size == 0 {
            return Err(anyhow!("mempool_max_size must be positive"));
        }
        Ok(())
    }

    /// Convert genesis config to core type
    pub fn genesis_doc(&self) -> Result<GenesisDoc> {
        let validators = self
            .genesis
            .validators
            .iter()
            .map(|entry| {
                let pub_key = PublicKey::from_hex(&entry.pub_key)
                    .map_err(|e| anyhow!("genesis validator {}: {}", entry.name, e))?;
                Ok(GenesisValidator {
                    pub_key,
                    power: entry.power,
                    name: entry.name.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let doc = GenesisDoc {
            chain_id: self.genesis.chain_id.clone(),
            genesis_time: self.genesis.genesis_time,
            validators,
            app_hash: empty_app_hash(),
        };
        doc.validate()?;
        Ok(doc)
    }

    pub fn validator_keypairs(&self) -> Result<Vec<KeyPair>> {
        self.validator_keys
            .iter()
            .enumerate()
            .map(|(i, key_hex)| {
                let secret = SecretKey::from_hex(key_hex)
                    .map_err(|e| anyhow!("validator key {}: {}", i, e))?;
                Ok(KeyPair::from_secret(secret))
            })
            .collect()
    }
}

/// A devnet configuration running `validators` fresh validators in one
/// process.
pub fn generate_devnet_config(validators: usize, data_dir: PathBuf) -> NodeConfig {
    let keys: Vec<KeyPair> = (0..validators).map(|_| KeyPair::generate()).collect();

    NodeConfig {
        data_dir,
        genesis: GenesisConfigFile {
            chain_id: "tendril-devnet".to_string(),
            genesis_time: now_millis(),
            validators: keys
                .iter()
                .enumerate()
                .map(|(i, key)| GenesisValidatorEntry {
                    pub_key: key.public.to_hex(),
                    power: 10,
                    name: format!("validator-{i}"),
                })
                .collect(),
        },
        validator_keys: keys.iter().map(|key| key.secret.to_hex()).collect(),
        txgen_interval_ms: 500,
        ..Default::default()
    }
}
