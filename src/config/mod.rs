/// Configuration system
///
/// - `macros`: `config_struct!` for structs with embedded defaults
/// - `schemas`: the `Config` / `ClusterConfig` definitions
/// - `utils`: loading from TOML
#[macro_use]
mod macros;
mod schemas;
mod utils;

pub use schemas::{AdvertiseMode, ClusterConfig, Config};
pub use utils::{load_config_from_path, CONFIG_FILE_PATH};
