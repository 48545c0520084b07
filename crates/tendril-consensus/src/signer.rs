use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tendril_core::{
    sign, Address, CoreError, Heartbeat, Height, Proposal, PublicKey, Round, SecretKey, Sig, Vote,
    VoteType,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("Height regression: last signed {last}, got {got}")]
    HeightRegression { last: Height, got: Height },

    #[error("Round regression at height {height}: last signed {last}, got {got}")]
    RoundRegression { height: Height, last: Round, got: Round },

    #[error("Step regression at {height}/{round}: last signed {last}, got {got}")]
    StepRegression {
        height: Height,
        round: Round,
        last: u8,
        got: u8,
    },

    #[error("Conflicting data at {height}/{round} step {step}")]
    ConflictingData { height: Height, round: Round, step: u8 },

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Signs consensus messages for one validator key.
pub trait Signer: Send {
    fn address(&self) -> Address;

    fn public_key(&self) -> PublicKey;

    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError>;

    fn sign_proposal(&mut self, chain_id: &str, proposal: &mut Proposal)
        -> Result<(), SignerError>;

    fn sign_heartbeat(&mut self, chain_id: &str, heartbeat: &mut Heartbeat)
        -> Result<(), SignerError>;
}

const STEP_PROPOSE: u8 = 1;
const STEP_PREVOTE: u8 = 2;
const STEP_PRECOMMIT: u8 = 3;

fn vote_step(vote_type: VoteType) -> u8 {
    match vote_type {
        VoteType::Prevote => STEP_PREVOTE,
        VoteType::Precommit => STEP_PRECOMMIT,
    }
}

/// Last (height, round, step) signed, with what was signed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSignState {
    pub height: Height,
    pub round: Round,
    pub step: u8,
    /// Hex of the signed bytes.
    pub sign_bytes: Option<String>,
    pub signature: Option<Sig>,
    pub timestamp: u64,
}

/// What to do with a sign request at a given HRS.
enum SignDecision {
    Sign,
    /// Same HRS and same bytes: hand back the previous signature.
    Reuse(Sig),
}

impl LastSignState {
    fn check(
        &self,
        height: Height,
        round: Round,
        step: u8,
        sign_bytes: &[u8],
    ) -> Result<SignDecision, SignerError> {
        if height < self.height {
            return Err(SignerError::HeightRegression { last: self.height, got: height });
        }
        if height > self.height {
            return Ok(SignDecision::Sign);
        }
        if round < self.round {
            return Err(SignerError::RoundRegression { height, last: self.round, got: round });
        }
        if round > self.round {
            return Ok(SignDecision::Sign);
        }
        if step < self.step {
            return Err(SignerError::StepRegression {
                height,
                round,
                last: self.step,
                got: step,
            });
        }
        if step > self.step {
            return Ok(SignDecision::Sign);
        }

        match (&self.sign_bytes, self.signature) {
            (Some(last_bytes), Some(sig)) if *last_bytes == hex::encode(sign_bytes) => {
                Ok(SignDecision::Reuse(sig))
            }
            _ => Err(SignerError::ConflictingData { height, round, step }),
        }
    }
}

/// Signer holding the key in memory, guarding against double signing with
/// a [`LastSignState`] that is optionally persisted as JSON.
pub struct LocalSigner {
    secret: SecretKey,
    public: PublicKey,
    last: LastSignState,
    path: Option<PathBuf>,
}

impl LocalSigner {
    pub fn new(secret: SecretKey) -> Self {
        let public = secret.public_key();
        LocalSigner {
            secret,
            public,
            last: LastSignState::default(),
            path: None,
        }
    }

    /// Signer whose last sign state lives at `path`, loaded if present.
    pub fn with_state_file(secret: SecretKey, path: impl Into<PathBuf>) -> Result<Self, SignerError> {
        let path = path.into();
        let last = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LastSignState::default(),
            Err(e) => return Err(e.into()),
        };
        debug!("Signer state {:?}: last signed {}/{}/{}", path, last.height, last.round, last.step);

        let mut signer = LocalSigner::new(secret);
        signer.last = last;
        signer.path = Some(path);
        Ok(signer)
    }

    pub fn last_sign_state(&self) -> &LastSignState {
        &self.last
    }

    fn record(
        &mut self,
        height: Height,
        round: Round,
        step: u8,
        sign_bytes: &[u8],
        signature: Sig,
        timestamp: u64,
    ) -> Result<(), SignerError> {
        self.last = LastSignState {
            height,
            round,
            step,
            sign_bytes: Some(hex::encode(sign_bytes)),
            signature: Some(signature),
            timestamp,
        };
        match &self.path {
            Some(path) => save_json(path, &self.last),
            None => Ok(()),
        }
    }
}

fn save_json(path: &Path, state: &LastSignState) -> Result<(), SignerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, serde_json::to_vec_pretty(state)?)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

impl Signer for LocalSigner {
    fn address(&self) -> Address {
        self.public.address()
    }

    fn public_key(&self) -> PublicKey {
        self.public
    }

    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError> {
        let step = vote_step(vote.vote_type);
        let mut sign_bytes = vote.sign_bytes(chain_id)?;

        // A re-sign that differs only in timestamp keeps the first timestamp.
        if vote.height == self.last.height
            && vote.round == self.last.round
            && step == self.last.step
            && vote.timestamp != self.last.timestamp
        {
            let mut probe = vote.clone();
            probe.timestamp = self.last.timestamp;
            let probe_bytes = probe.sign_bytes(chain_id)?;
            if self.last.sign_bytes.as_deref() == Some(hex::encode(&probe_bytes).as_str()) {
                vote.timestamp = self.last.timestamp;
                sign_bytes = probe_bytes;
            }
        }

        match self.last.check(vote.height, vote.round, step, &sign_bytes)? {
            SignDecision::Reuse(sig) => {
                debug!("Re-signing {} with the previous signature", vote);
                vote.signature = sig;
            }
            SignDecision::Sign => {
                vote.signature = sign(&self.secret, &sign_bytes);
                self.record(
                    vote.height,
                    vote.round,
                    step,
                    &sign_bytes,
                    vote.signature,
                    vote.timestamp,
                )?;
            }
        }
        Ok(())
    }

    fn sign_proposal(
        &mut self,
        chain_id: &str,
        proposal: &mut Proposal,
    ) -> Result<(), SignerError> {
        let mut sign_bytes = proposal.sign_bytes(chain_id)?;

        if proposal.height == self.last.height
            && proposal.round == self.last.round
            && self.last.step == STEP_PROPOSE
            && proposal.timestamp != self.last.timestamp
        {
            let mut probe = proposal.clone();
            probe.timestamp = self.last.timestamp;
            let probe_bytes = probe.sign_bytes(chain_id)?;
            if self.last.sign_bytes.as_deref() == Some(hex::encode(&probe_bytes).as_str()) {
                proposal.timestamp = self.last.timestamp;
                sign_bytes = probe_bytes;
            }
        }

        match self
            .last
            .check(proposal.height, proposal.round, STEP_PROPOSE, &sign_bytes)?
        {
            SignDecision::Reuse(sig) => proposal.signature = sig,
            SignDecision::Sign => {
                proposal.signature = sign(&self.secret, &sign_bytes);
                self.record(
                    proposal.height,
                    proposal.round,
                    STEP_PROPOSE,
                    &sign_bytes,
                    proposal.signature,
                    proposal.timestamp,
                )?;
            }
        }
        Ok(())
    }

    /// Heartbeats carry no consensus weight and skip the HRS guard.
    fn sign_heartbeat(
        &mut self,
        chain_id: &str,
        heartbeat: &mut Heartbeat,
    ) -> Result<(), SignerError> {
        if heartbeat.validator_address != self.address() {
            warn!("Signing heartbeat for foreign address {}", heartbeat.validator_address);
        }
        heartbeat.signature = sign(&self.secret, &heartbeat.sign_bytes(chain_id)?);
        Ok(())
    }
}
