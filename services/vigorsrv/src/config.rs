//! Configuration loading
//!
//! Priority (highest to lowest):
//! 1. `VIGOR_` environment variables, `__` between nesting levels
//!    (`VIGOR_LINK__UNIT_ID=21`)
//! 2. The configuration file (YAML or TOML, by extension)
//! 3. Defaults of the engine configuration types

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use std::path::Path;
use vigor_modbus::EngineConfig;

pub const ENV_PREFIX: &str = "VIGOR_";

fn file_provider(path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .with_context(|| format!("Config file must have an extension: {}", path.display()))?;

    let figment = match extension {
        "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
        "toml" => Figment::new().merge(Toml::file(path)),
        other => bail!("Unsupported config file format: {}", other),
    };
    Ok(figment)
}

/// Load and validate the engine configuration
pub fn load(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        bail!("Config file not found: {}", path.display());
    }

    let config: EngineConfig = file_provider(path)?
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}
