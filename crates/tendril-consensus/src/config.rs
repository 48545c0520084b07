use std::time::Duration;

use serde::{Deserialize, Serialize};
use tendril_core::Round;
use tokio::time::Instant;

use crate::error::ConsensusError;

/// Consensus timing and feature switches. Built once and shared as
/// `Arc<ConsensusConfig>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub timeout_propose_ms: u64,
    pub timeout_propose_delta_ms: u64,
    pub timeout_prevote_ms: u64,
    pub timeout_prevote_delta_ms: u64,
    pub timeout_precommit_ms: u64,
    pub timeout_precommit_delta_ms: u64,
    /// Wait after a commit before starting the next height.
    pub timeout_commit_ms: u64,
    /// Start the next height as soon as every precommit is in.
    pub skip_timeout_commit: bool,
    pub create_empty_blocks: bool,
    /// Propose an empty block after this long without transactions; 0 disables.
    pub empty_block_interval_ms: u64,
    pub use_aggregate_signature: bool,
    pub peer_queue_size: usize,
    pub internal_queue_size: usize,
    pub max_block_txs: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            timeout_propose_ms: 3000,
            timeout_propose_delta_ms: 500,
            timeout_prevote_ms: 1000,
            timeout_prevote_delta_ms: 500,
            timeout_precommit_ms: 1000,
            timeout_precommit_delta_ms: 500,
            timeout_commit_ms: 1000,
            skip_timeout_commit: false,
            create_empty_blocks: true,
            empty_block_interval_ms: 0,
            use_aggregate_signature: false,
            peer_queue_size: 1000,
            internal_queue_size: 1000,
            max_block_txs: 1000,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<(), ConsensusError> {
        let timeouts = [
            ("timeout_propose_ms", self.timeout_propose_ms),
            ("timeout_prevote_ms", self.timeout_prevote_ms),
            ("timeout_precommit_ms", self.timeout_precommit_ms),
            ("timeout_commit_ms", self.timeout_commit_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(ConsensusError::InvalidConfig(format!("{name} must be positive")));
        }
        if self.peer_queue_size == 0 || self.internal_queue_size == 0 {
            return Err(ConsensusError::InvalidConfig(
                "queue sizes must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn propose(&self, round: Round) -> Duration {
        linear(self.timeout_propose_ms, self.timeout_propose_delta_ms, round)
    }

    pub fn prevote(&self, round: Round) -> Duration {
        linear(self.timeout_prevote_ms, self.timeout_prevote_delta_ms, round)
    }

    pub fn precommit(&self, round: Round) -> Duration {
        linear(self.timeout_precommit_ms, self.timeout_precommit_delta_ms, round)
    }

    /// When the next height starts, given the commit time of this one.
    pub fn commit(&self, commit_time: Instant) -> Instant {
        commit_time + Duration::from_millis(self.timeout_commit_ms)
    }

    pub fn empty_block_interval(&self) -> Option<Duration> {
        (self.empty_block_interval_ms > 0).then(|| Duration::from_millis(self.empty_block_interval_ms))
    }
}

fn linear(base_ms: u64, delta_ms: u64, round: Round) -> Duration {
    Duration::from_millis(base_ms.saturating_add(delta_ms.saturating_mul(round as u64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_round_timeouts_grow() {
        let config = ConsensusConfig::default();
        assert_eq!(config.propose(0), Duration::from_millis(3000));
        assert_eq!(config.propose(2), Duration::from_millis(4000));
        assert_eq!(config.prevote(1), Duration::from_millis(1500));
        assert_eq!(config.precommit(3), Duration::from_millis(2500));
        assert_eq!(config.empty_block_interval(), None);
    }

    #[test]
    fn test_validate() {
        assert!(ConsensusConfig::default().validate().is_ok());

        let config = ConsensusConfig {
            timeout_prevote_ms: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(ConsensusError::InvalidConfig(_)));

        let config = ConsensusConfig {
            internal_queue_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ConsensusConfig =
            serde_json::from_str(r#"{"timeout_commit_ms": 10, "skip_timeout_commit": true}"#)
                .unwrap();
        assert_eq!(config.timeout_commit_ms, 10);
        assert!(config.skip_timeout_commit);
        assert_eq!(config.timeout_propose_ms, 3000);
    }
}
