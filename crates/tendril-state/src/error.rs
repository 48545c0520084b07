use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Invalid genesis: {0}")]
    InvalidGenesis(String),

    #[error("State height {state} does not match save height {height}")]
    HeightMismatch { height: u64, state: u64 },

    #[error("Core error: {0}")]
    Core(#[from] tendril_core::CoreError),
}
