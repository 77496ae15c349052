use thiserror::Error;

/// Errors raised while decoding, validating or encoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("invalid budget: {0}")]
    InvalidBudget(String),

    #[error("query {0} is already active on this node")]
    AlreadyActive(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
