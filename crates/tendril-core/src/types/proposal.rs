use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{sign, verify, Address, Hash, PublicKey, SecretKey, Sig};
use crate::error::CoreError;
use crate::serialize;
use crate::types::{now_millis, BlockId, Height, Round};

/// A proposer's signed claim that `block_hash` is the candidate for
/// (height, round).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    /// Round of the polka that justifies re-proposing a valid block.
    pub pol_round: Option<Round>,
    pub pol_block_id: BlockId,
    pub block_hash: Hash,
    pub timestamp: u64,
    pub signature: Sig,
}

#[derive(Serialize)]
struct CanonicalProposal<'a> {
    chain_id: &'a str,
    height: Height,
    round: Round,
    pol_round: Option<Round>,
    pol_block_id: BlockId,
    block_hash: Hash,
    timestamp: u64,
}

impl Proposal {
    pub fn new(
        height: Height,
        round: Round,
        block_hash: Hash,
        pol_round: Option<Round>,
        pol_block_id: BlockId,
    ) -> Self {
        Proposal {
            height,
            round,
            pol_round,
            pol_block_id,
            block_hash,
            timestamp: now_millis(),
            signature: Sig::default(),
        }
    }

    pub fn sign_bytes(&self, chain_id: &str) -> Result<Vec<u8>, CoreError> {
        serialize::to_bytes(&CanonicalProposal {
            chain_id,
            height: self.height,
            round: self.round,
            pol_round: self.pol_round,
            pol_block_id: self.pol_block_id,
            block_hash: self.block_hash,
            timestamp: self.timestamp,
        })
    }

    pub fn sign(&mut self, chain_id: &str, key: &SecretKey) -> Result<(), CoreError> {
        self.signature = sign(key, &self.sign_bytes(chain_id)?);
        Ok(())
    }

    pub fn verify(&self, chain_id: &str, key: &PublicKey) -> Result<(), CoreError> {
        verify(key, &self.sign_bytes(chain_id)?, &self.signature)
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pol = self
            .pol_round
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".into());
        write!(
            f,
            "Proposal{{{}/{} {} pol {}}}",
            self.height,
            self.round,
            self.block_hash.short(),
            pol
        )
    }
}

/// Liveness signal from a proposer waiting for transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub validator_address: Address,
    pub validator_index: u32,
    pub height: Height,
    pub round: Round,
    pub sequence: u64,
    pub signature: Sig,
}

#[derive(Serialize)]
struct CanonicalHeartbeat<'a> {
    chain_id: &'a str,
    validator_address: Address,
    validator_index: u32,
    height: Height,
    round: Round,
    sequence: u64,
}

impl Heartbeat {
    pub fn sign_bytes(&self, chain_id: &str) -> Result<Vec<u8>, CoreError> {
        serialize::to_bytes(&CanonicalHeartbeat {
            chain_id,
            validator_address: self.validator_address,
            validator_index: self.validator_index,
            height: self.height,
            round: self.round,
            sequence: self.sequence,
        })
    }

    pub fn verify(&self, chain_id: &str, key: &PublicKey) -> Result<(), CoreError> {
        verify(key, &self.sign_bytes(chain_id)?, &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_proposal_signature_binds_pol_round() {
        let kp = KeyPair::from_seed(3);
        let mut proposal = Proposal::new(4, 2, Hash([8; 32]), Some(1), BlockId::new(Hash([8; 32])));
        proposal.sign("chain", &kp.secret).unwrap();
        assert!(proposal.verify("chain", &kp.public).is_ok());

        proposal.pol_round = None;
        assert!(proposal.verify("chain", &kp.public).is_err());
    }

    #[test]
    fn test_heartbeat_verify() {
        let kp = KeyPair::from_seed(3);
        let mut hb = Heartbeat {
            validator_address: kp.address(),
            validator_index: 1,
            height: 9,
            round: 0,
            sequence: 2,
            signature: Sig::default(),
        };
        hb.signature = sign(&kp.secret, &hb.sign_bytes("c").unwrap());
        assert!(hb.verify("c", &kp.public).is_ok());
        hb.sequence = 3;
        assert!(hb.verify("c", &kp.public).is_err());
    }
}
