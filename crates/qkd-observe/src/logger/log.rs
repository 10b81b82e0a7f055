use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, fmt, fmt::time::OffsetTime, layer::SubscriberExt, util::SubscriberInitExt};

use crate::logger::{config::LoggerConfig, error::LoggerError};

/// HTTP stack targets held at `warn` unless the level names them.
const QUIET_DEPENDENCIES: &[&str] = &["hyper=warn", "tower=warn", "axum::rejection=warn"];

pub struct Logger;

impl Logger {
    pub fn text(cfg: &LoggerConfig, filter: EnvFilter) -> Result<(), LoggerError> {
        let layer = fmt::layer()
            .with_ansi(cfg.use_color)
            .with_target(cfg.with_targets)
            .with_timer(local_rfc3339());
        install(tracing_subscriber::registry().with(filter).with(layer))
    }

    pub fn json(cfg: &LoggerConfig, filter: EnvFilter) -> Result<(), LoggerError> {
        let layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_ansi(false)
            .with_target(cfg.with_targets)
            .with_timer(local_rfc3339());
        install(tracing_subscriber::registry().with(filter).with(layer))
    }

    pub fn journald(filter: EnvFilter) -> Result<(), LoggerError> {
        journald(filter)
    }
}

pub(crate) fn filter_for(level: &str) -> Result<EnvFilter, LoggerError> {
    let mut filter = EnvFilter::try_new(level).map_err(|e| LoggerError::InvalidLevel {
        level: level.to_string(),
        reason: e.to_string(),
    })?;
    for directive in QUIET_DEPENDENCIES {
        if level.contains(directive.split('=').next().unwrap_or_default()) {
            continue;
        }
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }
    Ok(filter)
}

fn local_rfc3339() -> OffsetTime<Rfc3339> {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetTime::new(offset, Rfc3339)
}

fn install<S>(subscriber: S) -> Result<(), LoggerError>
where
    S: Subscriber + Send + Sync + 'static,
{
    Ok(subscriber.try_init()?)
}

#[cfg(all(target_os = "linux", feature = "journald"))]
fn journald(filter: EnvFilter) -> Result<(), LoggerError> {
    let layer = tracing_journald::layer()
        .map_err(LoggerError::JournaldSocket)?
        .with_syslog_identifier("qkd-agentd".to_string());
    install(tracing_subscriber::registry().with(filter).with(layer))
}

#[cfg(not(all(target_os = "linux", feature = "journald")))]
fn journald(_filter: EnvFilter) -> Result<(), LoggerError> {
    Err(LoggerError::JournaldUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_accepts_directives_and_rejects_garbage() {
        assert!(filter_for("info").is_ok());
        assert!(filter_for("qkd.core=debug,warn").is_ok());
        assert!(matches!(filter_for("qkd=loud"), Err(LoggerError::InvalidLevel { .. })));
    }

    #[test]
    fn second_install_is_refused() {
        let cfg = LoggerConfig::default();
        let _ = Logger::text(&cfg, filter_for("info").unwrap());
        assert!(matches!(
            Logger::text(&cfg, filter_for("info").unwrap()),
            Err(LoggerError::Install(_))
        ));
    }
}
