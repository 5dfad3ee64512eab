/// Command-line argument handling for the broker node
///
/// Arguments are captured once into a process-wide store so any module can
/// check a flag without threading parsed options through constructors.
///
/// Recognized flags:
/// - `--config <path>`: configuration file (default `broker.toml`)
/// - `--log-file <path>`: also write plain log lines to a file
/// - `--verbose` / `-v`, `--quiet` / `-q`: log threshold
/// - `--debug-<tag>`: debug output for one subsystem (`--debug-cluster`, ...)
/// - `--new-license <secret> [--contract <n>]`: print an encoded license and exit
/// - `--help` / `-h`
use crate::config::CONFIG_FILE_PATH;
use crate::logger::{LogLevel, LogTag, LoggerConfig};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::sync::Mutex;

/// Global command-line arguments storage
pub static CMD_ARGS: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(env::args().collect()));

/// Override the captured arguments (tests and embedding)
pub fn set_cmd_args(args: Vec<String>) {
    if let Ok(mut cmd_args) = CMD_ARGS.lock() {
        *cmd_args = args;
    }
}

/// Copy of the current arguments
pub fn get_cmd_args() -> Vec<String> {
    match CMD_ARGS.lock() {
        Ok(args) => args.clone(),
        Err(_) => env::args().collect(),
    }
}

pub fn has_arg(arg: &str) -> bool {
    get_cmd_args().iter().any(|a| a == arg)
}

/// Value following `flag`, if any
pub fn get_arg_value(flag: &str) -> Option<String> {
    let args = get_cmd_args();
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .filter(|value| !value.starts_with("--"))
        .cloned()
}

pub fn is_help_requested() -> bool {
    has_arg("--help") || has_arg("-h")
}

pub fn is_verbose_mode() -> bool {
    has_arg("--verbose") || has_arg("-v")
}

pub fn is_quiet_mode() -> bool {
    has_arg("--quiet") || has_arg("-q")
}

pub fn config_path() -> PathBuf {
    get_arg_value("--config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_PATH))
}

pub fn log_file() -> Option<PathBuf> {
    get_arg_value("--log-file").map(PathBuf::from)
}

/// Secret for `--new-license`, when license generation was requested
pub fn new_license_secret() -> Option<String> {
    get_arg_value("--new-license")
}

pub fn license_contract() -> u32 {
    get_arg_value("--contract")
        .and_then(|value| value.parse().ok())
        .unwrap_or(1)
}

/// Debug keys enabled through `--debug-<key>` flags
pub fn get_enabled_debug_tags() -> HashSet<String> {
    get_cmd_args()
        .iter()
        .filter_map(|arg| arg.strip_prefix("--debug-"))
        .filter(|key| !key.is_empty())
        .map(|key| key.to_lowercase())
        .collect()
}

/// Logger configuration derived from the flags
pub fn to_logger_config() -> LoggerConfig {
    let min_level = if is_verbose_mode() {
        LogLevel::Verbose
    } else if is_quiet_mode() {
        LogLevel::Warning
    } else {
        LogLevel::Info
    };

    LoggerConfig {
        min_level,
        debug_tags: get_enabled_debug_tags(),
        log_file: log_file(),
    }
}

pub fn print_help() {
    println!("broker - pub/sub broker node\n");
    println!("USAGE:");
    println!("    broker [OPTIONS]\n");
    println!("OPTIONS:");
    println!("    --config <path>          Configuration file [default: {}]", CONFIG_FILE_PATH);
    println!("    --log-file <path>        Copy log output to a file");
    println!("    -v, --verbose            Show verbose output");
    println!("    -q, --quiet              Only show warnings and errors");
    println!("    --new-license <secret>   Print an encoded license and exit");
    println!("    --contract <n>           Contract number for --new-license [default: 1]");
    println!("    -h, --help               Show this help\n");
    println!("DEBUG FLAGS:");
    for tag in LogTag::all() {
        println!("    --debug-{}", tag.to_debug_key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    // The argument store is global; keep every assertion in one test
    #[test]
    fn test_flags_and_values() {
        set_cmd_args(args(&[
            "broker",
            "--config",
            "/etc/broker.toml",
            "--debug-cluster",
            "--debug-Events",
            "--verbose",
            "--log-file",
        ]));

        assert!(has_arg("--debug-cluster"));
        assert_eq!(config_path(), PathBuf::from("/etc/broker.toml"));
        assert_eq!(log_file(), None);
        assert!(new_license_secret().is_none());

        let logger = to_logger_config();
        assert_eq!(logger.min_level, LogLevel::Verbose);
        assert!(logger.debug_tags.contains("cluster"));
        assert!(logger.debug_tags.contains("events"));

        set_cmd_args(args(&["broker", "--quiet", "--new-license", "s3cret", "--contract", "9"]));
        assert_eq!(config_path(), PathBuf::from(CONFIG_FILE_PATH));
        assert_eq!(to_logger_config().min_level, LogLevel::Warning);
        assert_eq!(new_license_secret().as_deref(), Some("s3cret"));
        assert_eq!(license_contract(), 9);
    }
}
