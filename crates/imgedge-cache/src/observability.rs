// Tracing setup for hosts embedding the cache layer. The filter sits behind a
// reload handle so the level can change with a configuration swap.
use std::sync::OnceLock;

use imgedge_config::{LogFormat, LoggingConfig};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

static FILTER_HANDLE: OnceLock<FilterHandle> = OnceLock::new();

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing(logging: &LoggingConfig) {
    install(&logging.level, logging.format);
}

pub fn init_tracing_with_level(level: &str) {
    install(level, LogFormat::Text);
}

fn install(level: &str, format: LogFormat) {
    // RUST_LOG wins over the configured level
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")));

    let (filter_layer, handle) = reload::Layer::new(filter);
    let _ = FILTER_HANDLE.set(handle);

    let (json, text) = match format {
        LogFormat::Json => (Some(fmt::layer().json()), None),
        LogFormat::Text => (None, Some(fmt::layer())),
    };
    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(json)
        .with(text)
        .try_init();
}

/// Replace the active filter, e.g. `"debug"` or `"info,imgedge_cache=trace"`.
///
/// Returns false if tracing was not installed through this module or the
/// directive does not parse.
pub fn apply_logging_level(level: &str) -> bool {
    let Some(handle) = FILTER_HANDLE.get() else {
        return false;
    };
    match EnvFilter::try_new(level) {
        Ok(filter) => handle.modify(|f| *f = filter).is_ok(),
        Err(e) => {
            tracing::warn!(level, error = %e, "ignoring unparsable log filter");
            false
        }
    }
}
