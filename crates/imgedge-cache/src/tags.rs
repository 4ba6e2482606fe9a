//! Cache tag generation.
//!
//! Tags are built in a fixed order, then deduplicated (first occurrence
//! wins) and truncated to `max_tags`:
//!
//! 1. path tags (`path-`, `segment-N-`, `dir-`, `file-`)
//! 2. content type tags
//! 3. origin tag
//! 4. transform option tags
//! 5. request metadata tags (host, `cache-tags` query, tenant, size, hash, date, features, watermark, environment)
//! 6. static custom tags
//! 7. path-based tag groups
//! 8. conditional tags
//!
//! Simplified mode drops the per-segment, directory, origin, bucket and
//! metadata tags. Every tag carries the configured prefix.

use std::sync::{Arc, LazyLock};

use http::HeaderValue;
use http::header::{CONTENT_TYPE, HeaderName};
use imgedge_config::{AppConfig, CacheConfig, CacheMethod, PathNormalizationConfig};
use imgedge_core::{
    CacheError, ImageRequest, ImageResponse, SourceType, StorageResult, TransformOptions,
    header_str, query_param, request_url,
};
use indexmap::IndexSet;
use regex::Regex;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, warn};
use url::Url;

pub const CACHE_TAG_HEADER: HeaderName = HeaderName::from_static("cache-tag");

/// Segments this long or longer get no `segment-N-` tag.
const MAX_SEGMENT_TAG_LEN: usize = 50;

static TAG_VALUE_INVALID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]").expect("valid tag regex"));

/// Cache tags attached to an outbound request for the edge to index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCacheTags(pub Vec<String>);

/// Produces cache tags for a response.
pub trait TagGenerator: Send + Sync {
    fn generate_cache_tags(
        &self,
        request: &ImageRequest,
        storage: &StorageResult,
        options: &TransformOptions,
    ) -> Result<Vec<String>, CacheError>;

    /// Tags for a resource known only by path, with no storage or request
    /// metadata. Host and query derived tags are absent.
    fn tags_for_path(
        &self,
        path: &str,
        options: &TransformOptions,
    ) -> Result<Vec<String>, CacheError>;
}

/// Whether tags travel as a `Cache-Tag` response header.
///
/// Under the `cf` method they ride on the outbound request instead, unless
/// `use_response_header` forces the header. Exactly one of the two is used.
pub fn tags_in_response_header(cache: &CacheConfig) -> bool {
    cache.method != CacheMethod::Cf || cache.cache_tags.use_response_header
}

/// Replace every character outside `[A-Za-z0-9_-]` with `-`.
pub fn sanitize_tag_value(value: &str) -> String {
    TAG_VALUE_INVALID.replace_all(value, "-").into_owned()
}

/// Set `Cache-Tag` on a response, replacing any existing value.
pub fn attach_tag_header(
    mut response: ImageResponse,
    tags: &[String],
    one_header_per_tag: bool,
) -> ImageResponse {
    let headers = response.headers_mut();
    headers.remove(CACHE_TAG_HEADER);
    if tags.is_empty() {
        return response;
    }

    let values: Vec<String> = if one_header_per_tag {
        tags.to_vec()
    } else {
        vec![tags.join(",")]
    };
    for value in values {
        match HeaderValue::from_str(&value) {
            Ok(v) => {
                headers.append(CACHE_TAG_HEADER, v);
            }
            Err(e) => warn!(tag = %value, error = %e, "cache tag is not a valid header value"),
        }
    }
    response
}

pub fn width_bucket(px: u32) -> &'static str {
    match px {
        0..=100 => "tiny",
        101..=400 => "small",
        401..=800 => "medium",
        801..=1200 => "large",
        1201..=2000 => "xlarge",
        _ => "huge",
    }
}

pub fn size_bucket(bytes: u64) -> &'static str {
    let kb = bytes as f64 / 1024.0;
    if kb <= 10.0 {
        "mini"
    } else if kb <= 50.0 {
        "tiny"
    } else if kb <= 200.0 {
        "small"
    } else if kb <= 500.0 {
        "medium"
    } else if kb <= 1024.0 {
        "large"
    } else if kb <= 5120.0 {
        "xlarge"
    } else {
        "huge"
    }
}

/// How a path-based tag pattern is matched, decided once at construction.
#[derive(Debug, Clone)]
pub enum PathTagPattern {
    /// `products/`
    Prefix(String),
    /// `^...$`
    Regex(Regex),
    /// Contains `*`
    Glob(Regex),
    Substring(String),
}

impl PathTagPattern {
    /// Invalid regex and glob patterns fall back to substring matching.
    pub fn parse(pattern: &str) -> Self {
        if pattern.ends_with('/') {
            return PathTagPattern::Prefix(pattern.to_string());
        }
        if pattern.starts_with('^') && pattern.ends_with('$') {
            return match Regex::new(pattern) {
                Ok(re) => PathTagPattern::Regex(re),
                Err(e) => {
                    warn!(pattern, error = %e, "invalid path tag regex, using substring match");
                    PathTagPattern::Substring(pattern.to_string())
                }
            };
        }
        if pattern.contains('*') {
            return match Regex::new(&glob_to_regex(pattern)) {
                Ok(re) => PathTagPattern::Glob(re),
                Err(e) => {
                    warn!(pattern, error = %e, "invalid path tag glob, using substring match");
                    PathTagPattern::Substring(pattern.to_string())
                }
            };
        }
        PathTagPattern::Substring(pattern.to_string())
    }

    /// Matches either the path as given or with leading slashes stripped.
    pub fn matches(&self, path: &str) -> bool {
        let stripped = path.trim_start_matches('/');
        match self {
            PathTagPattern::Prefix(p) => path.starts_with(p.as_str()) || stripped.starts_with(p.as_str()),
            PathTagPattern::Regex(re) | PathTagPattern::Glob(re) => {
                re.is_match(path) || re.is_match(stripped)
            }
            PathTagPattern::Substring(s) => path.contains(s.as_str()),
        }
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConditionKind {
    Path,
    Format,
    Width,
    Height,
    ContentType,
    Host,
    Derivative,
    Query,
    Source,
    Feature,
}

impl ConditionKind {
    fn parse(key: &str) -> Option<Self> {
        Some(match key {
            "path" => ConditionKind::Path,
            "format" => ConditionKind::Format,
            "width" => ConditionKind::Width,
            "height" => ConditionKind::Height,
            "contentType" => ConditionKind::ContentType,
            "host" => ConditionKind::Host,
            "derivative" => ConditionKind::Derivative,
            "query" => ConditionKind::Query,
            "source" => ConditionKind::Source,
            "feature" => ConditionKind::Feature,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
struct ConditionalRule {
    /// `None` for unknown condition keys, which never match
    kind: Option<ConditionKind>,
    value: String,
    tags: Vec<String>,
}

/// Everything a tag rule may inspect for one response.
struct TagInput<'a> {
    path: &'a str,
    url: Option<&'a Url>,
    content_type: Option<&'a str>,
    source: Option<SourceType>,
    size: Option<u64>,
    content_hash: Option<&'a str>,
    options: &'a TransformOptions,
}

impl ConditionalRule {
    fn matches(&self, input: &TagInput<'_>) -> bool {
        let Some(kind) = self.kind else {
            return false;
        };
        let value = self.value.as_str();
        let opts = input.options;
        match kind {
            ConditionKind::Path => input.path.contains(value),
            ConditionKind::Format => opts.format.as_deref() == Some(value),
            ConditionKind::Width => opts.width.map(|w| w.to_string()).as_deref() == Some(value),
            ConditionKind::Height => opts.height.map(|h| h.to_string()).as_deref() == Some(value),
            ConditionKind::ContentType => input.content_type.is_some_and(|ct| ct.contains(value)),
            ConditionKind::Host => input
                .url
                .and_then(|u| u.host_str())
                .is_some_and(|h| h.contains(value)),
            ConditionKind::Derivative => opts.derivative.as_deref() == Some(value),
            ConditionKind::Query => input.url.is_some_and(|u| match value.split_once('=') {
                Some((name, expected)) => query_param(u, name).as_deref() == Some(expected),
                None => query_param(u, value).is_some(),
            }),
            ConditionKind::Source => input.source.is_some_and(|s| s.as_str() == value),
            ConditionKind::Feature => opts.has_feature(value),
        }
    }
}

struct PathNormalizer {
    leading: Regex,
    invalid: Regex,
    replacement: String,
}

impl PathNormalizer {
    fn new(config: &PathNormalizationConfig) -> Self {
        let defaults = PathNormalizationConfig::default();
        let compile = |source: &str, fallback: &str, what: &str| {
            Regex::new(source).unwrap_or_else(|e| {
                warn!(pattern = source, error = %e, what, "invalid path normalization regex, using default");
                Regex::new(fallback).expect("default normalization regex is valid")
            })
        };
        Self {
            leading: compile(
                &config.leading_slash_pattern,
                &defaults.leading_slash_pattern,
                "leading_slash_pattern",
            ),
            invalid: compile(
                &config.invalid_chars_pattern,
                &defaults.invalid_chars_pattern,
                "invalid_chars_pattern",
            ),
            replacement: config.replacement_char.clone(),
        }
    }

    fn normalize(&self, path: &str) -> String {
        let stripped = self.leading.replace(path, "");
        self.invalid
            .replace_all(&stripped, self.replacement.as_str())
            .into_owned()
    }
}

/// Builds cache tags and decides how they are attached.
pub struct CacheTagsManager {
    config: Arc<AppConfig>,
    normalizer: PathNormalizer,
    path_groups: Vec<(PathTagPattern, Vec<String>)>,
    conditional: Vec<ConditionalRule>,
}

impl CacheTagsManager {
    pub fn new(config: Arc<AppConfig>) -> Self {
        let tags = &config.cache.cache_tags;
        let normalizer = PathNormalizer::new(&tags.path_normalization);
        let path_groups = tags
            .path_based_tags
            .iter()
            .map(|(pattern, group)| (PathTagPattern::parse(pattern), group.clone()))
            .collect();
        let conditional = tags
            .conditional_tags
            .iter()
            .map(|(condition, group)| {
                let (key, value) = condition.split_once(':').unwrap_or((condition.as_str(), ""));
                let kind = ConditionKind::parse(key);
                if kind.is_none() {
                    debug!(condition = %condition, "unknown conditional tag key, rule never matches");
                }
                ConditionalRule {
                    kind,
                    value: value.to_string(),
                    tags: group.clone(),
                }
            })
            .collect();

        Self {
            config,
            normalizer,
            path_groups,
            conditional,
        }
    }

    /// Normalised path as used in tags: no leading slash, invalid characters replaced.
    pub fn normalize_path(&self, path: &str) -> String {
        self.normalizer.normalize(path)
    }

    /// Attach tags either to the outbound request or as a response header.
    ///
    /// Under the `cf` method tags ride on the request as [`RequestCacheTags`];
    /// otherwise (or with `use_response_header`) they become `Cache-Tag`.
    pub fn apply_tags(
        &self,
        request: &mut ImageRequest,
        response: ImageResponse,
        tags: &[String],
    ) -> ImageResponse {
        if tags.is_empty() {
            return response;
        }
        let cache = &self.config.cache;
        if tags_in_response_header(cache) {
            debug!(count = tags.len(), "attaching cache tags as response header");
            attach_tag_header(response, tags, cache.use_multiple_cache_tag_headers)
        } else {
            debug!(count = tags.len(), "attaching cache tags to request");
            request
                .extensions_mut()
                .insert(RequestCacheTags(tags.to_vec()));
            response
        }
    }

    fn build(&self, input: &TagInput<'_>) -> Vec<String> {
        let config = &self.config;
        let tag_config = &config.cache.cache_tags;
        let simplified = tag_config.simplified_tags;
        let opts = input.options;
        let mut raw: Vec<String> = Vec::new();

        // 1. Path
        let normalized = self.normalize_path(input.path);
        let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
        if let Some(file) = segments.last() {
            raw.push(format!("path-{}", segments.join("-")));
            if !simplified {
                for (i, segment) in segments.iter().enumerate() {
                    if segment.len() < MAX_SEGMENT_TAG_LEN {
                        raw.push(format!("segment-{i}-{segment}"));
                    }
                }
                if segments.len() > 1 {
                    raw.push(format!("dir-{}", segments[..segments.len() - 1].join("-")));
                }
            }
            raw.push(format!("file-{file}"));
        }

        // 2. Content type
        if let Some(ct) = input.content_type {
            let essence = ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase();
            let (category, subtype) = essence.split_once('/').unwrap_or((essence.as_str(), ""));
            if !category.is_empty() {
                raw.push(format!("type-{category}"));
                if !simplified && !subtype.is_empty() {
                    raw.push(format!("content-{category}-{subtype}"));
                }
            }
        }

        // 3. Origin
        if !simplified {
            if let Some(source) = input.source {
                raw.push(format!("origin-{source}"));
            }
        }

        // 4. Transform options
        if let Some(format) = opts.format.as_deref() {
            raw.push(format!("format-{format}"));
        }
        if let Some(width) = opts.width {
            raw.push(format!("width-{width}"));
            if !simplified {
                raw.push(format!("width-bucket-{}", width_bucket(width)));
            }
        }
        if let Some(height) = opts.height {
            raw.push(format!("height-{height}"));
            if !simplified {
                raw.push(format!("height-bucket-{}", width_bucket(height)));
            }
        }
        if let Some(quality) = opts.quality {
            raw.push(format!("quality-{quality}"));
        }
        if let Some(fit) = opts.fit.as_deref() {
            raw.push(format!("fit-{fit}"));
        }
        if let Some(derivative) = opts.derivative.as_deref() {
            raw.push(format!("derivative-{derivative}"));
        }

        // 5. Request metadata
        if !simplified {
            if let Some(host) = input.url.and_then(|u| u.host_str()) {
                raw.push(format!("host-{host}"));
            }
            if let Some(custom) = input.url.and_then(|u| query_param(u, "cache-tags")) {
                raw.extend(
                    custom
                        .split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from),
                );
            }
            if let Some(tenant) = opts.tenant.as_deref() {
                raw.push(format!("tenant-{tenant}"));
            }
            if let Some(size) = input.size {
                raw.push(format!("size-{}", size_bucket(size)));
            }
            if let Some(hash) = input.content_hash {
                raw.push(format!("hash-{hash}"));
            }
            raw.push(date_tag(OffsetDateTime::now_utc()));
            raw.extend(opts.features.iter().map(|f| format!("feature-{f}")));
            if let Some(watermark) = opts.watermark.as_deref() {
                raw.push("watermarked".to_string());
                raw.push(format!("watermark-{watermark}"));
            }
            raw.push(format!("env-{}", config.environment));
        }

        // 6. Static custom tags
        raw.extend(tag_config.custom_tags.iter().cloned());

        // 7. Path groups
        for (pattern, group) in &self.path_groups {
            if pattern.matches(input.path) {
                raw.extend(group.iter().cloned());
            }
        }

        // 8. Conditional
        for rule in &self.conditional {
            if rule.matches(input) {
                raw.extend(rule.tags.iter().cloned());
            }
        }

        let unique: IndexSet<String> = raw
            .iter()
            .map(|tag| format!("{}{}", tag_config.prefix, sanitize_tag_value(tag)))
            .collect();
        let total = unique.len();
        let mut tags: Vec<String> = unique.into_iter().collect();
        if total > tag_config.max_tags {
            warn!(
                generated = total,
                max_tags = tag_config.max_tags,
                path = input.path,
                "cache tags truncated"
            );
            tags.truncate(tag_config.max_tags);
        }
        tags
    }
}

fn date_tag(now: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day]");
    match now.format(&format) {
        Ok(date) => format!("date-{date}"),
        Err(_) => format!("date-{}", now.date()),
    }
}

impl TagGenerator for CacheTagsManager {
    fn generate_cache_tags(
        &self,
        request: &ImageRequest,
        storage: &StorageResult,
        options: &TransformOptions,
    ) -> Result<Vec<String>, CacheError> {
        if !self.config.cache.cache_tags.enabled {
            return Ok(Vec::new());
        }
        let url = request_url(request)
            .map_err(|e| CacheError::tag_generation(format!("cannot resolve request URL: {e}")))?;

        let path = if storage.path.is_empty() {
            options.path.as_deref().unwrap_or(url.path())
        } else {
            storage.path.as_str()
        };
        let content_type = storage
            .content_type
            .as_deref()
            .or_else(|| header_str(storage.response.headers(), CONTENT_TYPE));

        let input = TagInput {
            path,
            url: Some(&url),
            content_type,
            source: Some(storage.source_type),
            size: storage.size,
            content_hash: storage.content_hash.as_deref(),
            options,
        };
        Ok(self.build(&input))
    }

    fn tags_for_path(
        &self,
        path: &str,
        options: &TransformOptions,
    ) -> Result<Vec<String>, CacheError> {
        if !self.config.cache.cache_tags.enabled {
            return Ok(Vec::new());
        }
        let input = TagInput {
            path,
            url: None,
            content_type: None,
            source: None,
            size: None,
            content_hash: None,
            options,
        };
        Ok(self.build(&input))
    }
}
