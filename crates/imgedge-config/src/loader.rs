use crate::AppConfig;
use config::{Config, Environment, File};
use std::path::{Path, PathBuf};

/// Default file looked up when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "imgedge.toml";

/// Load, merge and validate configuration.
///
/// Sources, lowest priority first: the TOML file (if it exists), then
/// environment variables such as `IMGEDGE__CACHE__TTL__OK=3600`.
pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
    let mut builder = Config::builder();
    let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
    if pathbuf.exists() {
        builder = builder.add_source(File::from(pathbuf));
    } else if path.is_some() {
        tracing::warn!(path = ?pathbuf, "config file not found, using defaults");
    }
    builder = builder.add_source(
        Environment::with_prefix("IMGEDGE")
            .try_parsing(true)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.bypass_params")
            .with_list_parse_key("cache.bypass_paths")
            .with_list_parse_key("cache.bypass_formats"),
    );
    let cfg = builder
        .build()
        .map_err(|e| format!("config build error: {e}"))?;
    let merged: AppConfig = cfg
        .try_deserialize()
        .map_err(|e| format!("config deserialize error: {e}"))?;
    merged.validate()?;
    Ok(merged)
}

pub fn load_config_with_default_path<P: AsRef<Path>>(
    path: Option<P>,
) -> Result<AppConfig, String> {
    let p = path
        .as_ref()
        .map(|p| p.as_ref().to_string_lossy().to_string());
    load_config(p.as_deref())
}

/// Parse configuration from an in-memory TOML string (no env overrides).
pub fn from_toml_str(content: &str) -> Result<AppConfig, String> {
    let cfg: AppConfig =
        toml::from_str(content).map_err(|e| format!("config deserialize error: {e}"))?;
    cfg.validate()?;
    Ok(cfg)
}
