/// Logger configuration storage
///
/// Held in a process-wide static so any module can log without threading a
/// handle through; configured once from command-line arguments.
use super::levels::LogLevel;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct LoggerConfig {
    /// Minimum level shown (Warning with --quiet, Verbose with --verbose)
    pub min_level: LogLevel,
    /// Tags with debug output enabled (lowercase debug keys)
    pub debug_tags: HashSet<String>,
    /// Optional file that receives a plain-text copy of every log line
    pub log_file: Option<PathBuf>,
}

static LOGGER_CONFIG: Lazy<RwLock<LoggerConfig>> =
    Lazy::new(|| RwLock::new(LoggerConfig::default()));

pub fn get_logger_config() -> LoggerConfig {
    LOGGER_CONFIG.read().clone()
}

pub fn set_logger_config(config: LoggerConfig) {
    *LOGGER_CONFIG.write() = config;
}
