//! Structured logging system for the broker node
//!
//! This module provides a small, ergonomic logging API with:
//! - Standard log levels (Error/Warning/Info/Debug/Verbose)
//! - Per-tag debug control via --debug-<tag> flags
//! - Dual output: colored console + optional file persistence
//!
//! ## Usage
//!
//! ```rust
//! use broker::logger::{self, LogTag};
//!
//! logger::error(LogTag::Listener, "Accept failed");
//! logger::warning(LogTag::Cluster, "Seed unreachable");
//! logger::info(LogTag::Service, "Listening on 0.0.0.0:8080");
//! logger::debug(LogTag::Events, "Applied + chat/room1"); // Only if --debug-events
//! logger::verbose(LogTag::Cluster, "Gossip packet ..."); // Only if --verbose
//! ```
//!
//! ## Initialization
//!
//! Call once at startup, after arguments are parsed:
//! ```rust
//! broker::logger::init(broker::logger::LoggerConfig::default());
//! ```

mod config;
mod core;
mod file;
mod format;
mod levels;
mod tags;

pub use config::{get_logger_config, set_logger_config, LoggerConfig};
pub use levels::LogLevel;
pub use tags::LogTag;

/// Initialize the logger system
///
/// Installs the configuration and opens the log file if one was requested.
/// Logging before `init` falls back to console output with default filtering.
pub fn init(config: LoggerConfig) {
    let log_file = config.log_file.clone();
    set_logger_config(config);

    if let Some(path) = log_file {
        if let Err(e) = file::init_file_logging(&path) {
            eprintln!("Failed to open log file '{}': {}", path.display(), e);
        }
    }
}

/// Log at ERROR level (always shown, critical issues)
pub fn error(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Error, message);
}

/// Log at WARNING level (important issues)
///
/// Warnings are shown by default (unless --quiet is used).
pub fn warning(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Warning, message);
}

/// Log at INFO level (standard operations)
pub fn info(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Info, message);
}

/// Log at DEBUG level (detailed diagnostics)
///
/// Debug logs are ONLY shown when the --debug-<tag> flag is provided.
///
/// # Example
/// ```rust
/// // Only shown with --debug-cluster
/// broker::logger::debug(broker::logger::LogTag::Cluster, "Probe ack from node-b");
/// ```
pub fn debug(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Debug, message);
}

/// Log at VERBOSE level (very detailed tracing)
///
/// Verbose logs are ONLY shown when --verbose flag is provided.
pub fn verbose(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Verbose, message);
}

/// Force flush all pending log writes
///
/// Call this during shutdown to ensure all logs are written to disk.
pub fn flush() {
    file::flush_file_logging();
}
