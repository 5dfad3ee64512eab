/// Configuration loading
///
/// Reads the TOML file into a `Config`. A missing file is not an error: the
/// node starts with built-in defaults so a bare `broker` invocation works.
use super::schemas::Config;
use crate::errors::ConfigError;
use crate::logger::{self, LogTag};
use std::path::Path;

/// Default configuration file path
pub const CONFIG_FILE_PATH: &str = "broker.toml";

/// Load configuration from a specific file path
///
/// # Returns
/// - `Ok(Config)` - parsed (or default) configuration, already validated
/// - `Err(ConfigError)` - unreadable, unparsable or invalid file
pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let display = path.display().to_string();

    let config = if path.exists() {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;

        let config = toml::from_str::<Config>(&contents).map_err(|e| ConfigError::Parse {
            path: display.clone(),
            message: e.to_string(),
        })?;
        logger::debug(
            LogTag::Config,
            &format!("Loaded configuration from {}", display),
        );
        config
    } else {
        logger::warning(
            LogTag::Config,
            &format!("Config file '{}' not found, using default values", display),
        );
        Config::default()
    };

    config.validate()?;
    Ok(config)
}
