//! Configuration for the imgedge caching subsystem.
//!
//! - [`AppConfig`] is the fully-typed schema; every optional field has a default.
//! - [`loader`] merges a TOML file with `IMGEDGE__*` environment overrides.
//! - [`ConfigurationService`] hands out immutable snapshots and swaps them atomically.

pub mod cache;
pub mod loader;
pub mod service;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub use cache::{
    CacheConfig, CacheMethod, CacheTagsConfig, CdnDirectivesConfig, CircuitBreakerConfig,
    ImmutableContentConfig, PathNormalizationConfig, PathPattern, PatternTtl, ResilienceConfig,
    ResourceHintsConfig, RetryConfig, TransformCacheConfig, TtlConfig,
};
pub use service::ConfigurationService;

/// Error types for configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ConfigError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    #[default]
    Production,
}

impl Environment {
    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Cache subsystem configuration
    #[serde(default)]
    pub cache: CacheConfig,
}

impl AppConfig {
    /// Validate cross-field constraints once, right after loading.
    pub fn validate(&self) -> Result<(), String> {
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }

        let cache = &self.cache;
        if cache.cache_tags.max_tags == 0 {
            return Err("cache.cache_tags.max_tags must be > 0".into());
        }
        if let (Some(min), Some(max)) = (cache.min_ttl, cache.max_ttl) {
            if min > max {
                return Err("cache.min_ttl must be <= cache.max_ttl".into());
            }
        }

        // Path pattern names identify patterns in logs and must be unique
        let mut names = HashSet::new();
        for pattern in &cache.path_patterns {
            if !names.insert(pattern.name.as_str()) {
                return Err(format!(
                    "cache.path_patterns contains duplicate name '{}'",
                    pattern.name
                ));
            }
        }

        let retry = &cache.resilience.retry;
        if retry.max_attempts == 0 {
            return Err("cache.resilience.retry.max_attempts must be > 0".into());
        }
        if retry.backoff_factor < 1.0 {
            return Err("cache.resilience.retry.backoff_factor must be >= 1.0".into());
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err("cache.resilience.retry.jitter must be within [0, 1]".into());
        }
        if cache.resilience.circuit_breaker.failure_threshold == 0 {
            return Err("cache.resilience.circuit_breaker.failure_threshold must be > 0".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
