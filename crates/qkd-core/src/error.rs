use qkd_model::ModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("exec error: {0}")]
    Exec(#[from] qkd_exec::ExecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("negotiation mismatch: {0}")]
    NegotiationMismatch(String),

    #[error("negotiation did not finish within {0}ms")]
    NegotiationTimeout(u128),

    #[error("link is not connected")]
    NotConnected,

    #[error("operation not allowed in state {0}")]
    InvalidState(String),

    #[error("synchronization failed: {0}")]
    Sync(String),

    #[error("raw key classification failed: {0}")]
    Classification(String),

    #[error("unparsable output from {program}: {output}")]
    BadOutput { program: String, output: String },

    #[error("relay channel closed")]
    ChannelClosed,

    #[error("operation cancelled")]
    Cancelled,
}

pub type CoreResult<T> = Result<T, CoreError>;
