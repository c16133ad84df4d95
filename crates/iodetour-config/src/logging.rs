//! Structured logging utilities for iodetour components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//! The macros accept the same arguments as the `tracing` macros and add a
//! `component` field.
//!
//! # Usage
//!
//! ```ignore
//! use iodetour_config::*;
//!
//! log_server_info!(clients = 3, "pipe server finished");
//! log_launcher_debug!(pid = child.pid, "child resumed");
//! ```

use std::str::FromStr;

use crate::{ConfigError, ENV_LOG};

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const LAUNCHER: &'static str = "LAUNCHER";
    pub const SERVER: &'static str = "SERVER";
    pub const HOOKS: &'static str = "HOOKS";
    pub const CHANNEL: &'static str = "CHANNEL";
    pub const REGISTRY: &'static str = "REGISTRY";
}

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
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(ConfigError::InvalidLevel(s.to_string())),
        }
    }
}

// === LAUNCHER logging macros ===

#[macro_export]
macro_rules! log_launcher_error {
    ($($arg:tt)+) => {
        tracing::error!(component = "LAUNCHER", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_launcher_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "LAUNCHER", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_launcher_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "LAUNCHER", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_launcher_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "LAUNCHER", $($arg)+)
    };
}

// === SERVER logging macros ===

#[macro_export]
macro_rules! log_server_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "SERVER", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_server_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "SERVER", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_server_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "SERVER", $($arg)+)
    };
}

// === HOOKS logging macros ===

#[macro_export]
macro_rules! log_hooks_error {
    ($($arg:tt)+) => {
        tracing::error!(component = "HOOKS", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_hooks_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "HOOKS", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_hooks_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "HOOKS", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_hooks_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "HOOKS", $($arg)+)
    };
}

// === CHANNEL logging macros ===

#[macro_export]
macro_rules! log_channel_error {
    ($($arg:tt)+) => {
        tracing::error!(component = "CHANNEL", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_channel_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "CHANNEL", $($arg)+)
    };
}

// === REGISTRY logging macros ===

#[macro_export]
macro_rules! log_registry_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "REGISTRY", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_registry_trace {
    ($($arg:tt)+) => {
        tracing::trace!(component = "REGISTRY", $($arg)+)
    };
}

fn env_filter(level: LogLevel) -> tracing_subscriber::EnvFilter {
    use tracing_subscriber::EnvFilter;

    EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(level.as_filter()))
}

/// Initialize logging with the given level filter.
/// Call this once at application startup. `IOWRAPPER_LOG` overrides `level`.
pub fn init_logging(level: LogLevel) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Initialize logging into an already opened file (used by the hooks DLL,
/// whose host may have no usable stderr).
pub fn init_file_logging(file: std::fs::File, level: LogLevel) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .with_thread_ids(true)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::LAUNCHER, "LAUNCHER");
        assert_eq!(Component::SERVER, "SERVER");
        assert_eq!(Component::HOOKS, "HOOKS");
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("Debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!(matches!(
            "loud".parse::<LogLevel>(),
            Err(ConfigError::InvalidLevel(_))
        ));
        assert_eq!(LogLevel::Trace.as_filter(), "trace");
    }

    #[test]
    fn test_macros_expand() {
        let count = 3;
        crate::log_server_info!(count, "macro with shorthand field");
        crate::log_launcher_debug!(path = %"C:\\x", "macro with display field");
        crate::log_registry_trace!("plain message");
    }
}
