use thiserror::Error;

/// Reasons the agent's logger cannot be set up from its configuration.
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("unknown log format {0:?}; expected text, json or journald")]
    UnknownFormat(String),
    #[error("journald output needs a Linux build with the `journald` feature")]
    JournaldUnavailable,
    #[error("cannot connect to journald: {0}")]
    JournaldSocket(#[source] std::io::Error),
    #[error("invalid log level {level:?}: {reason}")]
    InvalidLevel { level: String, reason: String },
    #[error("cannot install the global logger: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}
