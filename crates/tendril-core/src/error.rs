use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid address")]
    InvalidAddress,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Duplicate validator {0}")]
    DuplicateValidator(String),

    #[error("Empty validator set")]
    EmptyValidatorSet,

    #[error("Validator set has no voting power")]
    NoVotingPower,

    #[error("Total voting power exceeds {max}")]
    VotingPowerTooLarge { max: u64 },

    #[error("Validator update changes too much power: changed {changed}, total {total}")]
    ValidatorChangeTooLarge { changed: u64, total: u64 },

    #[error("Unknown validator {0}")]
    UnknownValidator(String),

    #[error("Invalid aggregate vote: {0}")]
    InvalidAggregate(String),

    #[error("Invalid commit: {0}")]
    InvalidCommit(String),

    #[error("Insufficient voting power: got {got}, need {need}")]
    InsufficientVotingPower { got: u64, need: u64 },

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}
