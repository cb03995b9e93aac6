use std::fs;
use std::path::Path;

use pc_core::CoreConfig;

use crate::error::Result;

pub const CONFIG_FILE: &str = "config.toml";

/// Parse and validate a TOML configuration file. Missing keys take their
/// defaults.
pub fn load_config(path: &Path) -> Result<CoreConfig> {
    let raw = fs::read_to_string(path)?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<CoreConfig> {
    let config: CoreConfig = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default(path: &Path) -> Result<CoreConfig> {
    if path.exists() {
        tracing::debug!(path = %path.display(), "loading configuration");
        load_config(path)
    } else {
        Ok(CoreConfig::default())
    }
}

/// Render the effective configuration as TOML.
pub fn config_to_toml(config: &CoreConfig) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}
