//! Structured logging utilities for idgraph components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use idgraph_config::log_identity_info;
//!
//! log_identity_info!("Entity created", entity_id = id.as_str());
//! log_packer_debug!("Bucket written", key = key.as_str());
//! ```

/// Values of the `component` field set by the `log_*` macros
pub struct Component;

impl Component {
    pub const IDENTITY: &'static str = "IDENTITY";
    pub const PACKER: &'static str = "PACKER";
    pub const LOADER: &'static str = "LOADER";
    pub const CLI: &'static str = "CLI";
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
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }

    fn as_filter(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

// === IDENTITY logging macros ===

#[macro_export]
macro_rules! log_identity_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = $crate::logging::Component::IDENTITY, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_identity_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = $crate::logging::Component::IDENTITY, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_identity_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = $crate::logging::Component::IDENTITY, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_identity_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::IDENTITY, $($key = $value,)* $msg)
    };
}

// === PACKER logging macros ===

#[macro_export]
macro_rules! log_packer_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = $crate::logging::Component::PACKER, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_packer_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::PACKER, $($key = $value,)* $msg)
    };
}

// === LOADER logging macros ===

#[macro_export]
macro_rules! log_loader_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = $crate::logging::Component::LOADER, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_loader_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::LOADER, $($key = $value,)* $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = $crate::logging::Component::CLI, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cli_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::CLI, $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
///
/// `IDGRAPH_LOG` takes precedence over `RUST_LOG`; both override `level`.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_env("IDGRAPH_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::IDENTITY, "IDENTITY");
        assert_eq!(Component::PACKER, "PACKER");
        assert_eq!(Component::LOADER, "LOADER");
        assert_eq!(Component::CLI, "CLI");
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("loud"), None);
    }

    #[test]
    fn test_macros_expand_with_fields() {
        let id = "abc";
        log_identity_debug!("macro smoke", entity_id = id, count = 3);
        log_packer_debug!("macro smoke");
        log_loader_info!("macro smoke", workers = 4);
        log_cli_debug!("macro smoke",);
    }
}
