//! Default logger setup.
//!
//! The filter sits behind a reload handle so a workflow can change the
//! verbosity after start-up. `RUST_LOG`, when set, wins over the configured
//! level at initialisation.

use std::sync::OnceLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

use crate::config::LogLevel;
use crate::error::ConfigError;

static FILTER: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Install the global subscriber at `level`.
///
/// Fails when another global subscriber is already installed.
pub fn init(level: LogLevel) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))?;
    let _ = FILTER.set(handle);
    Ok(())
}

/// Install the global subscriber at the `WFL_LOGLEVEL` level.
pub fn init_from_env() -> Result<(), ConfigError> {
    init(LogLevel::from_env())
}

/// Change the level of the installed subscriber, installing one if needed.
pub fn set_level(level: LogLevel) -> Result<(), ConfigError> {
    match FILTER.get() {
        Some(handle) => handle
            .reload(EnvFilter::new(level.as_filter()))
            .map_err(|e| ConfigError::Logging(e.to_string())),
        None => init(level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_level_installs_and_reloads() {
        // another test binary may own the global subscriber already
        if set_level(LogLevel::Info).is_ok() {
            set_level(LogLevel::Debug).unwrap();
            set_level(LogLevel::None).unwrap();
            assert!(init(LogLevel::Error).is_err());
        }
    }
}
