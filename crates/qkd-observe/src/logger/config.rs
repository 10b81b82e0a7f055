use std::io::IsTerminal;

use crate::logger::{error::LoggerError, format::LoggerFormat};

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
}

impl LoggerConfig {
    /// Build from the textual options of the node configuration.
    pub fn from_options(format: &str, level: &str, with_targets: bool) -> Result<Self, LoggerError> {
        Ok(Self {
            format: format.parse()?,
            level: level.to_string(),
            with_targets,
            ..Self::default()
        })
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        let use_color = cfg!(test) || std::io::stdout().is_terminal();
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_override_defaults() {
        let cfg = LoggerConfig::from_options("json", "qkd=debug", false).unwrap();
        assert_eq!(cfg.format, LoggerFormat::Json);
        assert_eq!(cfg.level, "qkd=debug");
        assert!(!cfg.with_targets);
        assert!(LoggerConfig::from_options("xml", "info", true).is_err());
    }
}
