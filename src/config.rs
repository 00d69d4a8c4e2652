pub mod registry;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub use registry::RegistryConfig;

/// Process-level settings resolved from `config/local.*` and `CONVOY__`
/// environment variables. The service registry itself lives in its own YAML
/// document referenced by `registry_path`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConvoyConfig {
    #[serde(default)]
    pub registry_path: Option<String>,
}

impl ConvoyConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("CONVOY").separator("__"))
            .build()?
            .try_deserialize()
    }
}
