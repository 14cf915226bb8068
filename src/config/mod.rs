mod settings;

use config::{Config, Environment, File};

use settings::PartialSettings;

use crate::utils::Result;

pub use settings::{
    AmqpSettings, ConsumerSettings, LogSettings, MemorySettings, Settings, TopologySettings,
};

/// Prefix of the environment variables read by [`load_config`], e.g. `MEMQ_AMQP__URI`.
pub const ENV_PREFIX: &str = "MEMQ";

/// Loads the configuration from `config/default.*`, `.env` and the environment.
///
/// Values not provided anywhere fall back to `Settings::default()`.
pub fn load_config() -> Result<Settings> {
    // .env only fills variables that are not already set
    let _ = dotenvy::dotenv();
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit config file base name (no extension) and
/// without reading `.env`.
pub fn load_config_from(file: &str) -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_with_defaults())
}
