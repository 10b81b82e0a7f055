//! Global `tracing` subscriber for the agent: text, JSON or journald output behind one level filter.
mod config;
mod error;
mod format;
mod log;

pub use config::LoggerConfig;
pub use error::LoggerError;
pub use format::LoggerFormat;

use log::{Logger, filter_for};

/// Install the subscriber described by `cfg`.
///
/// The level is checked before anything global is touched, so a bad level never leaves a half-installed logger.
pub fn logger_init(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    let filter = filter_for(&cfg.level)?;
    match cfg.format {
        LoggerFormat::Text => Logger::text(cfg, filter),
        LoggerFormat::Json => Logger::json(cfg, filter),
        LoggerFormat::Journald => Logger::journald(filter),
    }
}
