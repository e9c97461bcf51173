//! Logging setup.
//!
//! The library only emits `tracing` events; binaries and tests call
//! [`init_logging`] once to print them. `RUST_LOG` takes precedence over
//! the level passed in.

use tracing_subscriber::EnvFilter;

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Install a fmt subscriber. Returns false if one was already installed.
pub fn init_logging(level: LogLevel) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        init_logging(LogLevel::Debug);
        assert!(!init_logging(LogLevel::Info));
        assert_eq!(LogLevel::Warn.as_filter(), "warn");
    }
}
