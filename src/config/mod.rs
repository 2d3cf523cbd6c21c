//! Server configuration.
//!
//! Settings are read from an optional TOML file and then from `EFTL_`
//! environment variables (`__` separates sections, e.g.
//! `EFTL_SERVER__PORT=9292`), and merged over the defaults.

mod settings;

use config::{Config, Environment, File};

use crate::utils::error::Result;

pub use settings::{
    AuthSettings, BrokerSettings, PartialSettings, ServerSettings, Settings, UserSettings,
};

const DEFAULT_CONFIG_PATH: &str = "config/default";

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings> {
    load_config_from(DEFAULT_CONFIG_PATH)
}

/// Loads the configuration from `path` (extension optional, file optional)
/// and environment variables, merged with default values.
pub fn load_config_from(path: &str) -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("EFTL")
                .prefix_separator("_")
                .separator("__"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merge(partial))
}
