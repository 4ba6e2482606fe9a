//! Shared, atomically replaceable configuration.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{AppConfig, ConfigError};

/// Read-mostly configuration handle.
///
/// `get_config()` is a lock-free pointer load; `replace()` validates the new
/// configuration and swaps it in wholesale so readers never observe a
/// half-applied update.
#[derive(Clone)]
pub struct ConfigurationService {
    inner: Arc<ArcSwap<AppConfig>>,
}

impl ConfigurationService {
    pub fn new(config: AppConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Current configuration snapshot.
    pub fn get_config(&self) -> Arc<AppConfig> {
        self.inner.load_full()
    }

    pub fn replace(&self, config: AppConfig) -> Result<(), ConfigError> {
        config.validate().map_err(ConfigError::validation)?;
        self.inner.store(Arc::new(config));
        tracing::info!("configuration replaced");
        Ok(())
    }
}

impl Default for ConfigurationService {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}
