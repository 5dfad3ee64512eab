/// Core logging implementation with automatic filtering
///
/// This module contains the central logging logic that:
/// - Checks if a log should be displayed based on level and tag
/// - Delegates to the format module for rendering and writing
use super::config::get_logger_config;
use super::levels::LogLevel;
use super::tags::LogTag;

/// Check if a log message should be displayed
///
/// Filtering rules:
/// 1. Errors are always shown
/// 2. Check against minimum log level threshold
/// 3. Debug level requires --debug-<tag> for that tag
/// 4. Verbose level requires --verbose
pub fn should_log(tag: &LogTag, level: LogLevel) -> bool {
    let config = get_logger_config();

    // Rule 1: Errors always log (critical)
    if level == LogLevel::Error {
        return true;
    }

    // Rule 3: Debug level requires debug mode for that specific tag
    if level == LogLevel::Debug {
        return config.min_level >= LogLevel::Verbose
            || config.debug_tags.contains(&tag.to_debug_key());
    }

    // Rules 2 and 4: threshold check covers both warnings under --quiet and verbose
    level <= config.min_level
}

/// Internal logging function with automatic filtering
pub fn log_internal(tag: LogTag, level: LogLevel, message: &str) {
    if !should_log(&tag, level) {
        return;
    }

    super::format::format_and_log(tag, level.as_str(), message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::config::{set_logger_config, LoggerConfig};
    use std::collections::HashSet;

    #[test]
    fn test_filtering_rules() {
        let mut debug_tags = HashSet::new();
        debug_tags.insert("cluster".to_string());
        set_logger_config(LoggerConfig {
            min_level: LogLevel::Info,
            debug_tags,
            log_file: None,
        });

        assert!(should_log(&LogTag::Events, LogLevel::Error));
        assert!(should_log(&LogTag::Events, LogLevel::Info));
        assert!(should_log(&LogTag::Cluster, LogLevel::Debug));
        assert!(!should_log(&LogTag::Events, LogLevel::Debug));
        assert!(!should_log(&LogTag::Cluster, LogLevel::Verbose));

        set_logger_config(LoggerConfig::default());
    }
}
