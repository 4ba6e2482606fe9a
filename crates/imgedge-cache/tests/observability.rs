use imgedge_cache::observability::{apply_logging_level, init_tracing};
use imgedge_config::LoggingConfig;

#[test]
fn log_filter_reloads_after_init() {
    assert!(!apply_logging_level("debug"));

    init_tracing(&LoggingConfig::default());
    assert!(apply_logging_level("debug"));
    assert!(apply_logging_level("info,imgedge_cache=trace"));

    // Second init keeps the first subscriber and handle
    init_tracing(&LoggingConfig::default());
    assert!(apply_logging_level("warn"));
}
