//! Structured logging utilities for local workspace components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use lws_config::log_engine_debug;
//!
//! log_engine_debug!("Pended edit", target = "$/Proj/a.txt");
//! log_baseline_warn!("Deleting corrupt baseline", guid = tracing::field::display(guid));
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const ENGINE: &'static str = "ENGINE";
    pub const TABLES: &'static str = "TABLES";
    pub const BASELINE: &'static str = "BASELINE";
    pub const LOCK: &'static str = "LOCK";
    pub const RECONCILE: &'static str = "RECONCILE";
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

// === ENGINE logging macros ===

#[macro_export]
macro_rules! log_engine_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "ENGINE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_engine_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "ENGINE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_engine_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "ENGINE", $($key = $value,)* $msg)
    };
}

// === TABLES logging macros ===

#[macro_export]
macro_rules! log_tables_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "TABLES", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_tables_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "TABLES", $($key = $value,)* $msg)
    };
}

// === BASELINE logging macros ===

#[macro_export]
macro_rules! log_baseline_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "BASELINE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_baseline_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "BASELINE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_baseline_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "BASELINE", $($key = $value,)* $msg)
    };
}

// === LOCK logging macros ===

#[macro_export]
macro_rules! log_lock_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "LOCK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_lock_trace {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::trace!(component = "LOCK", $($key = $value,)* $msg)
    };
}

// === RECONCILE logging macros ===

#[macro_export]
macro_rules! log_reconcile_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "RECONCILE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_reconcile_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "RECONCILE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_reconcile_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "RECONCILE", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // A second call (common in tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
