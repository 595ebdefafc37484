mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;
pub use settings::{BrokerSettings, ConsumerSettings, PublisherSettings, RunSettings, Settings};

pub const DEFAULT_CONFIG_PATH: &str = "config/default";
pub const ENV_PREFIX: &str = "DEDUPSUB";

/// Loads the configuration from `config/default` and the environment.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(DEFAULT_CONFIG_PATH)
}

/// Loads the configuration from an optional file at `path` (any format
/// the `config` crate recognises by extension) and `DEDUPSUB_*`
/// environment variables, e.g. `DEDUPSUB_PUBLISHER__BATCH_SIZE=25`.
/// Whatever is missing falls back to `Settings::default()`. The result
/// is not validated: callers apply their overrides first, then call
/// [`Settings::validate`].
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}
