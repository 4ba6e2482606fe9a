//! Cache subsystem configuration.
//!
//! Every field has a documented default so an empty `[cache]` table is valid.
//! Ordered maps are `IndexMap` because several lookups are first-match.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// How responses are cached at the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMethod {
    /// Edge-native caching via fetch directives
    #[default]
    Cf,
    /// Explicit cache store reads and writes
    CacheApi,
    /// No edge caching
    #[serde(rename = "none")]
    Disabled,
}

impl std::fmt::Display for CacheMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheMethod::Cf => write!(f, "cf"),
            CacheMethod::CacheApi => write!(f, "cache-api"),
            CacheMethod::Disabled => write!(f, "none"),
        }
    }
}

/// Top-level cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub method: CacheMethod,

    /// Global kill switch: when false no cache headers are applied at all
    #[serde(default = "default_true")]
    pub cacheability: bool,

    #[serde(default)]
    pub ttl: TtlConfig,

    /// Prioritised path patterns; non-empty selects the path-pattern TTL calculator
    #[serde(default)]
    pub path_patterns: Vec<PathPattern>,

    /// Derivative name -> TTL seconds (path-pattern calculator)
    #[serde(default)]
    pub derivative_ttls: IndexMap<String, u64>,

    /// Path substring -> TTL seconds, first match replaces the computed TTL
    #[serde(default)]
    pub path_based_ttl: IndexMap<String, u64>,

    #[serde(default)]
    pub cache_tags: CacheTagsConfig,

    /// Query parameters that force an edge cache bypass
    #[serde(default = "default_bypass_params")]
    pub bypass_params: Vec<String>,

    /// Path substrings that bypass caching
    #[serde(default)]
    pub bypass_paths: Vec<String>,

    /// Output formats that bypass caching
    #[serde(default)]
    pub bypass_formats: Vec<String>,

    #[serde(default)]
    pub bypass_for_admin: bool,

    /// Header whose presence marks an admin request
    #[serde(default = "default_admin_role_header")]
    pub admin_role_header: String,

    #[serde(default = "default_true")]
    pub bypass_in_development: bool,

    #[serde(default)]
    pub transform_cache: TransformCacheConfig,

    #[serde(default = "default_true")]
    pub enable_stale_while_revalidate: bool,

    #[serde(default = "default_true")]
    pub enable_background_caching: bool,

    #[serde(default)]
    pub enable_resource_hints: bool,

    #[serde(default)]
    pub resource_hints: ResourceHintsConfig,

    #[serde(default)]
    pub immutable_content: ImmutableContentConfig,

    #[serde(default = "default_true")]
    pub vary_on_client_hints: bool,

    #[serde(default)]
    pub vary_on_user_agent: bool,

    #[serde(default = "default_true")]
    pub vary_on_save_data: bool,

    #[serde(default)]
    pub min_ttl: Option<u64>,

    #[serde(default)]
    pub max_ttl: Option<u64>,

    /// Log `v=` version parameters as cache-key differentiators
    #[serde(default = "default_true")]
    pub version_bypass: bool,

    #[serde(default)]
    pub cdn_directives: CdnDirectivesConfig,

    /// Emit one `Cache-Tag` header per tag instead of a comma-joined value
    #[serde(default)]
    pub use_multiple_cache_tag_headers: bool,

    /// Make non-default-cacheable responses eligible for edge caching
    #[serde(default = "default_true")]
    pub cache_everything: bool,

    /// Send a per-status TTL table to the edge instead of one flat TTL
    #[serde(default)]
    pub use_ttl_by_status: bool,

    /// Status range (`200-299`, `404`) -> TTL seconds; derived from `ttl` when empty
    #[serde(default)]
    pub cache_ttl_by_status: IndexMap<String, u64>,

    #[serde(default)]
    pub resilience: ResilienceConfig,

    #[serde(default = "default_true")]
    pub enable_cache_metrics: bool,
}

fn default_true() -> bool {
    true
}

fn default_bypass_params() -> Vec<String> {
    vec!["nocache".to_string()]
}

fn default_admin_role_header() -> String {
    "x-admin-role".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            method: CacheMethod::default(),
            cacheability: true,
            ttl: TtlConfig::default(),
            path_patterns: Vec::new(),
            derivative_ttls: IndexMap::new(),
            path_based_ttl: IndexMap::new(),
            cache_tags: CacheTagsConfig::default(),
            bypass_params: default_bypass_params(),
            bypass_paths: Vec::new(),
            bypass_formats: Vec::new(),
            bypass_for_admin: false,
            admin_role_header: default_admin_role_header(),
            bypass_in_development: true,
            transform_cache: TransformCacheConfig::default(),
            enable_stale_while_revalidate: true,
            enable_background_caching: true,
            enable_resource_hints: false,
            resource_hints: ResourceHintsConfig::default(),
            immutable_content: ImmutableContentConfig::default(),
            vary_on_client_hints: true,
            vary_on_user_agent: false,
            vary_on_save_data: true,
            min_ttl: None,
            max_ttl: None,
            version_bypass: true,
            cdn_directives: CdnDirectivesConfig::default(),
            use_multiple_cache_tag_headers: false,
            cache_everything: true,
            use_ttl_by_status: false,
            cache_ttl_by_status: IndexMap::new(),
            resilience: ResilienceConfig::default(),
            enable_cache_metrics: true,
        }
    }
}

/// Status-bucket TTLs in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    #[serde(default = "default_ttl_ok")]
    pub ok: u64,
    #[serde(default = "default_ttl_redirects")]
    pub redirects: u64,
    #[serde(default = "default_ttl_client_error")]
    pub client_error: u64,
    #[serde(default = "default_ttl_server_error")]
    pub server_error: u64,
}

fn default_ttl_ok() -> u64 {
    86_400
}
fn default_ttl_redirects() -> u64 {
    86_400
}
fn default_ttl_client_error() -> u64 {
    60
}
fn default_ttl_server_error() -> u64 {
    10
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            ok: default_ttl_ok(),
            redirects: default_ttl_redirects(),
            client_error: default_ttl_client_error(),
            server_error: default_ttl_server_error(),
        }
    }
}

/// A prioritised path pattern with its own TTL table.
///
/// The pattern named `default` is the unconditional fallback; its matcher is
/// ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathPattern {
    pub name: String,
    /// Regex source matched against the request path
    #[serde(default)]
    pub matcher: String,
    pub ttl: PatternTtl,
    /// Higher wins; equal priorities keep declaration order
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: Option<String>,
}

impl PathPattern {
    pub fn is_default(&self) -> bool {
        self.name == "default"
    }
}

/// Per-status TTLs for a path pattern; missing buckets fall back to `ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternTtl {
    pub ok: u64,
    #[serde(default)]
    pub redirects: Option<u64>,
    #[serde(default)]
    pub client_error: Option<u64>,
    #[serde(default)]
    pub server_error: Option<u64>,
}

impl PatternTtl {
    pub const fn uniform(ok: u64) -> Self {
        Self {
            ok,
            redirects: None,
            client_error: None,
            server_error: None,
        }
    }
}

/// Cache tag generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTagsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prepended to every generated tag
    #[serde(default = "default_tag_prefix")]
    pub prefix: String,

    #[serde(default = "default_max_tags")]
    pub max_tags: usize,

    /// Emit only the essential path, type and option tags
    #[serde(default)]
    pub simplified_tags: bool,

    /// Static tags added to every response
    #[serde(default)]
    pub custom_tags: Vec<String>,

    /// Path pattern -> tags. `foo/` is a prefix, `^...$` a regex, `*` a glob,
    /// anything else a substring.
    #[serde(default)]
    pub path_based_tags: IndexMap<String, Vec<String>>,

    #[serde(default)]
    pub path_normalization: PathNormalizationConfig,

    /// `condition:value` -> tags, e.g. `format:webp`
    #[serde(default)]
    pub conditional_tags: IndexMap<String, Vec<String>>,

    /// Put tags in a `Cache-Tag` response header even for the `cf` method
    #[serde(default)]
    pub use_response_header: bool,
}

fn default_tag_prefix() -> String {
    "img-".to_string()
}

fn default_max_tags() -> usize {
    20
}

impl Default for CacheTagsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_tag_prefix(),
            max_tags: default_max_tags(),
            simplified_tags: false,
            custom_tags: Vec::new(),
            path_based_tags: IndexMap::new(),
            path_normalization: PathNormalizationConfig::default(),
            conditional_tags: IndexMap::new(),
            use_response_header: false,
        }
    }
}

/// Regexes used to turn a path into tag-safe segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathNormalizationConfig {
    #[serde(default = "default_leading_slash_pattern")]
    pub leading_slash_pattern: String,
    #[serde(default = "default_invalid_chars_pattern")]
    pub invalid_chars_pattern: String,
    #[serde(default = "default_replacement_char")]
    pub replacement_char: String,
}

fn default_leading_slash_pattern() -> String {
    "^/+".to_string()
}
fn default_invalid_chars_pattern() -> String {
    "[^a-zA-Z0-9/_-]".to_string()
}
fn default_replacement_char() -> String {
    "-".to_string()
}

impl Default for PathNormalizationConfig {
    fn default() -> Self {
        Self {
            leading_slash_pattern: default_leading_slash_pattern(),
            invalid_chars_pattern: default_invalid_chars_pattern(),
            replacement_char: default_replacement_char(),
        }
    }
}

/// Transform-result (KV) cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformCacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Name of the store binding
    #[serde(default = "default_transform_binding")]
    pub binding: String,
    /// Path substrings never written to the transform store
    #[serde(default)]
    pub disallowed_paths: Vec<String>,
    /// Honour client `Cache-Control`/`Pragma` for the transform store
    #[serde(default)]
    pub respect_client_cache_control: bool,
    #[serde(default = "default_transform_ttl")]
    pub ttl: u64,
    /// Largest body stored, in bytes
    #[serde(default = "default_transform_max_size")]
    pub max_size: u64,
    #[serde(default = "default_transform_key_prefix")]
    pub key_prefix: String,
}

fn default_transform_binding() -> String {
    "IMAGE_TRANSFORMATIONS_CACHE".to_string()
}
fn default_transform_ttl() -> u64 {
    86_400
}
fn default_transform_max_size() -> u64 {
    10 * 1024 * 1024
}
fn default_transform_key_prefix() -> String {
    "transform".to_string()
}

impl Default for TransformCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binding: default_transform_binding(),
            disallowed_paths: Vec::new(),
            respect_client_cache_control: false,
            ttl: default_transform_ttl(),
            max_size: default_transform_max_size(),
            key_prefix: default_transform_key_prefix(),
        }
    }
}

/// `Link` header hints for HTML responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceHintsConfig {
    /// Origins to preconnect to
    #[serde(default)]
    pub preconnect: Vec<String>,
    /// Path substring -> image URLs to preload
    #[serde(default)]
    pub preload_patterns: IndexMap<String, Vec<String>>,
}

/// Rules marking content as `immutable`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImmutableContentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_immutable_content_types")]
    pub content_types: Vec<String>,
    /// Path prefixes whose fingerprinted files never change
    #[serde(default = "default_immutable_paths")]
    pub paths: Vec<String>,
    #[serde(default = "default_immutable_derivatives")]
    pub derivatives: Vec<String>,
}

fn default_immutable_content_types() -> Vec<String> {
    [
        "image/svg+xml",
        "font/woff",
        "font/woff2",
        "font/ttf",
        "font/otf",
        "application/font-woff",
        "application/font-woff2",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_immutable_paths() -> Vec<String> {
    ["/static/", "/assets/", "/dist/"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_immutable_derivatives() -> Vec<String> {
    ["icon", "logo", "favicon"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ImmutableContentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            content_types: default_immutable_content_types(),
            paths: default_immutable_paths(),
            derivatives: default_immutable_derivatives(),
        }
    }
}

/// Extra `Cache-Control` directives aimed at CDNs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdnDirectivesConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub no_transform: bool,
    #[serde(default = "default_true")]
    pub stale_if_error: bool,
    #[serde(default = "default_stale_if_error_time")]
    pub stale_if_error_time: u64,
}

fn default_stale_if_error_time() -> u64 {
    86_400
}

impl Default for CdnDirectivesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            no_transform: true,
            stale_if_error: true,
            stale_if_error_time: default_stale_if_error_time(),
        }
    }
}

/// Retry and circuit breaker settings for edge cache I/O.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Fraction of the delay randomised in either direction
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    2_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cool-down before a half-open trial
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}
