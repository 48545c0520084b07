use tendril_core::{Address, Block, BlockId, Commit, Height, Round, ValidatorUpdate};
use tendril_state::{State, StateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Application error: {0}")]
    Application(String),
}

/// Builds, checks and applies blocks on behalf of the consensus engine.
pub trait BlockExecutor: Send {
    /// A new block on top of `state` for `round`, carrying `last_commit`.
    fn create_proposal_block(
        &mut self,
        state: &State,
        round: Round,
        last_commit: Option<Commit>,
        proposer: Address,
    ) -> Result<Block, ExecutorError>;

    fn validate_block(&self, state: &State, block: &Block) -> Result<(), ExecutorError>;

    /// Executes a committed block and returns the state after it.
    fn apply_block(
        &mut self,
        state: &State,
        block_id: BlockId,
        block: &Block,
    ) -> Result<State, ExecutorError>;

    /// Whether transactions are waiting to be proposed.
    fn txs_available(&self) -> bool {
        false
    }
}

/// Source of validator changes decided by the application.
pub trait ValidatorSource: Send {
    /// Changes produced by the block at `height`; they take effect at
    /// `height + 1`.
    fn validator_updates(&self, height: Height) -> Result<Vec<ValidatorUpdate>, ExecutorError>;
}
