use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid epoch: {0}")]
    InvalidEpoch(String),
    #[error("unknown message: {0}")]
    UnknownMessage(String),
    #[error("malformed message '{line}': {reason}")]
    MalformedMessage { line: String, reason: String },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("failed to read config: {0}")]
    ConfigIo(String),
}
