use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("{name} is already running")]
    AlreadyRunning { name: String },
    #[error("non-zero exit code: {code}")]
    NonZeroExit { code: i32 },
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("killed by signal")]
    KilledBySignal,
    #[error("missing program")]
    MissingProgram,
    #[error("{program} did not finish within {after_ms}ms")]
    Timeout { program: String, after_ms: u128 },
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e.to_string())
    }
}

pub type ExecResult<T> = Result<T, ExecError>;
