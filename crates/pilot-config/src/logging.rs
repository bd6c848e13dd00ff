//! Structured logging utilities for pilot components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use pilot_config::{log_lock_warn, log_fs_debug};
//!
//! log_lock_warn!("Ordering violation", lock = "ticket", dispenser = 3, serve = 1);
//! log_fs_debug!("Appended write to log", path = %original.display());
//! ```
//!
//! Fields after the message are handed to `tracing` unchanged, so the `%`
//! and `?` sigils work as they do there. Callers must depend on `tracing`.

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const LOCK: &'static str = "LOCK";
    pub const FS: &'static str = "FS";
    pub const REGISTRY: &'static str = "REGISTRY";
    pub const CONTEXT: &'static str = "CONTEXT";
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

// === LOCK logging macros ===

#[macro_export]
macro_rules! log_lock_warn {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::warn!(component = $crate::logging::Component::LOCK, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_lock_info {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::info!(component = $crate::logging::Component::LOCK, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_lock_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = $crate::logging::Component::LOCK, $($($field)+,)? $msg)
    };
}

// === FS logging macros ===

#[macro_export]
macro_rules! log_fs_warn {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::warn!(component = $crate::logging::Component::FS, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_fs_info {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::info!(component = $crate::logging::Component::FS, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_fs_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = $crate::logging::Component::FS, $($($field)+,)? $msg)
    };
}

// === REGISTRY logging macros ===

#[macro_export]
macro_rules! log_registry_error {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::error!(component = $crate::logging::Component::REGISTRY, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_registry_warn {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::warn!(component = $crate::logging::Component::REGISTRY, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_registry_info {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::info!(component = $crate::logging::Component::REGISTRY, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_registry_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = $crate::logging::Component::REGISTRY, $($($field)+,)? $msg)
    };
}

// === CONTEXT logging macros ===

#[macro_export]
macro_rules! log_context_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = $crate::logging::Component::CONTEXT, $($($field)+,)? $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup; `RUST_LOG` wins when set.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    // A second call (e.g. from several tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
