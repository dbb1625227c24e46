//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::template::JobTemplate;

/// Session name used when none is configured.
pub const DEFAULT_SESSION_NAME: &str = "wfl";

/// Capacity of a [`crate::Notifier`] channel.
pub const NOTIFIER_CAPACITY: usize = 1024;

/// Verbosity of the default logger, read from `WFL_LOGLEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    #[default]
    Error,
    None,
}

impl LogLevel {
    /// Level from `WFL_LOGLEVEL`. Unset or unparsable values give the default.
    pub fn from_env() -> Self {
        std::env::var("WFL_LOGLEVEL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::None => "off",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "NONE" | "OFF" => Ok(LogLevel::None),
            other => Err(ConfigError::InvalidValue {
                key: "WFL_LOGLEVEL".to_string(),
                message: format!("unknown level {other:?}"),
            }),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::None => "NONE",
        };
        f.write_str(s)
    }
}

/// Settings of a process-backed context.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    /// libSQL file remembering sessions; in-memory when `None`.
    pub db_file: Option<PathBuf>,
    /// Job session the workflow opens.
    pub session_name: String,
    /// Merged under every submitted template.
    pub default_template: JobTemplate,
    /// Job category used when a template leaves it empty.
    pub default_image: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            db_file: None,
            session_name: DEFAULT_SESSION_NAME.to_string(),
            default_template: JobTemplate::default(),
            default_image: String::new(),
        }
    }
}

impl ProcessConfig {
    /// Read `WFL_DB_FILE` and `WFL_SESSION`.
    pub fn from_env() -> Self {
        let db_file = std::env::var("WFL_DB_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let session_name = std::env::var("WFL_SESSION")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_string());
        Self {
            db_file,
            session_name,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!(" none ".parse::<LogLevel>().unwrap(), LogLevel::None);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::default(), LogLevel::Error);
        assert_eq!(LogLevel::None.as_filter(), "off");
        assert_eq!(LogLevel::Warning.to_string(), "WARNING");
    }

    #[test]
    fn test_process_config_default() {
        let config = ProcessConfig::default();
        assert_eq!(config.session_name, "wfl");
        assert!(config.db_file.is_none());
        assert!(config.default_image.is_empty());
    }
}
