//! Path-pattern TTL calculation.
//!
//! Patterns are sorted by priority (descending, stable) and compiled once.
//! The compiled set lives behind an `ArcSwap`: [`PathPatternTtlCalculator::update_patterns`]
//! builds a complete replacement and swaps it in, so a lookup always sees one
//! consistent set.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use imgedge_config::{AppConfig, PathPattern, PatternTtl};
use imgedge_core::{CacheError, ImageResponse, StorageResult, TransformOptions};
use regex::Regex;
use tracing::{debug, warn};

use crate::ttl::{
    StatusBucket, TtlCalculate, adjust_for_content_type, clamp_ttl, resource_path,
    response_content_type,
};

/// Used when no pattern named `default` is configured.
pub const FALLBACK_PATTERN_TTL: PatternTtl = PatternTtl {
    ok: 300,
    redirects: Some(300),
    client_error: Some(60),
    server_error: Some(10),
};

#[derive(Debug)]
struct CompiledPattern {
    name: String,
    regex: Regex,
    ttl: PatternTtl,
}

#[derive(Debug)]
struct PatternSet {
    patterns: Vec<CompiledPattern>,
    default_ttl: Option<PatternTtl>,
}

impl PatternSet {
    fn compile(patterns: &[PathPattern]) -> Result<Self, CacheError> {
        let mut sorted: Vec<&PathPattern> = patterns.iter().collect();
        // Stable: equal priorities keep declaration order
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

        let default_ttl = sorted.iter().find(|p| p.is_default()).map(|p| p.ttl);

        let mut compiled = Vec::new();
        let mut candidates = 0usize;
        for pattern in sorted.into_iter().filter(|p| !p.is_default()) {
            candidates += 1;
            match Regex::new(&pattern.matcher) {
                Ok(regex) => compiled.push(CompiledPattern {
                    name: pattern.name.clone(),
                    regex,
                    ttl: pattern.ttl,
                }),
                Err(e) => warn!(
                    pattern = %pattern.name,
                    matcher = %pattern.matcher,
                    error = %e,
                    "skipping path pattern with invalid regex"
                ),
            }
        }

        if candidates > 0 && compiled.is_empty() {
            return Err(CacheError::ttl_calculator_init(format!(
                "none of the {candidates} path pattern matchers compiled"
            )));
        }

        Ok(Self {
            patterns: compiled,
            default_ttl,
        })
    }
}

/// TTL calculator driven by prioritised path patterns.
pub struct PathPatternTtlCalculator {
    config: Arc<AppConfig>,
    patterns: ArcSwap<PatternSet>,
    warned_missing_default: AtomicBool,
}

impl PathPatternTtlCalculator {
    /// Compile the patterns from `config.cache.path_patterns`.
    pub fn new(config: Arc<AppConfig>) -> Result<Self, CacheError> {
        let set = PatternSet::compile(&config.cache.path_patterns)?;
        debug!(patterns = set.patterns.len(), "path pattern TTL calculator ready");
        Ok(Self {
            config,
            patterns: ArcSwap::from_pointee(set),
            warned_missing_default: AtomicBool::new(false),
        })
    }

    /// Replace the pattern set wholesale. On error the previous set stays active.
    pub fn update_patterns(&self, patterns: Vec<PathPattern>) -> Result<(), CacheError> {
        let set = PatternSet::compile(&patterns)?;
        debug!(patterns = set.patterns.len(), "path patterns replaced");
        self.patterns.store(Arc::new(set));
        self.warned_missing_default.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Names of the compiled patterns in match order.
    pub fn pattern_names(&self) -> Vec<String> {
        self.patterns
            .load()
            .patterns
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    /// Name of the first pattern matching `path`, if any.
    pub fn matching_pattern(&self, path: &str) -> Option<String> {
        self.patterns
            .load()
            .patterns
            .iter()
            .find(|p| p.regex.is_match(path))
            .map(|p| p.name.clone())
    }

    fn default_ttl(&self, set: &PatternSet) -> PatternTtl {
        match set.default_ttl {
            Some(ttl) => ttl,
            None => {
                if !self.warned_missing_default.swap(true, Ordering::Relaxed) {
                    warn!("no default path pattern configured, using built-in fallback TTLs");
                }
                FALLBACK_PATTERN_TTL
            }
        }
    }

    fn table_for(&self, path: Option<&str>) -> PatternTtl {
        let set = self.patterns.load();
        let matched = path.and_then(|path| {
            set.patterns.iter().find(|p| p.regex.is_match(path)).map(|p| {
                debug!(path, pattern = %p.name, "path pattern matched");
                p.ttl
            })
        });
        matched.unwrap_or_else(|| self.default_ttl(&set))
    }
}

impl TtlCalculate for PathPatternTtlCalculator {
    fn calculate_ttl(
        &self,
        response: &ImageResponse,
        options: &TransformOptions,
        storage: Option<&StorageResult>,
    ) -> u64 {
        let cache = &self.config.cache;
        let table = self.table_for(resource_path(options, storage));
        let bucket = StatusBucket::from_status(response.status().as_u16());
        let mut ttl = bucket.select_pattern(&table);

        if let Some(override_ttl) = options
            .derivative
            .as_deref()
            .and_then(|d| cache.derivative_ttls.get(d))
        {
            ttl = *override_ttl;
        }

        if bucket == StatusBucket::Ok {
            ttl = adjust_for_content_type(ttl, response_content_type(response, storage));
        }

        clamp_ttl(ttl, cache.min_ttl, cache.max_ttl)
    }
}
