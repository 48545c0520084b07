use serde::{Deserialize, Serialize};
use tendril_core::{Hash, PublicKey, Validator, ValidatorSet};

use crate::error::StateError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub pub_key: PublicKey,
    pub power: u64,
    #[serde(default)]
    pub name: String,
}

/// Initial chain parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisDoc {
    pub chain_id: String,
    /// Unix milliseconds
    pub genesis_time: u64,
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub app_hash: Hash,
}

impl GenesisDoc {
    pub fn validate(&self) -> Result<(), StateError> {
        if self.chain_id.is_empty() {
            return Err(StateError::InvalidGenesis("empty chain id".into()));
        }
        if let Some(v) = self.validators.iter().find(|v| v.power == 0) {
            return Err(StateError::InvalidGenesis(format!(
                "validator {} has no power",
                v.pub_key.address()
            )));
        }
        self.validator_set()?;
        Ok(())
    }

    pub fn validator_set(&self) -> Result<ValidatorSet, StateError> {
        let validators = self
            .validators
            .iter()
            .map(|v| Validator::new(v.pub_key, v.power))
            .collect();
        Ok(ValidatorSet::new(validators)?)
    }
}
