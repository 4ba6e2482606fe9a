//! Heuristic TTL calculation.
//!
//! The base TTL comes from the status bucket. For successful responses the
//! heuristics below then run in order; floors and ceilings only tighten,
//! while the derivative table and `path_based_ttl` replace outright.
//!
//! 1. origin `max-age` (60s..=1y) caps the TTL
//! 2. content type floors/ceilings
//! 3. derivative table
//! 4. pixel count
//! 5. quality
//! 6. `path_based_ttl` substring overrides
//! 7. path keywords
//!
//! The result is finally clamped to `[min_ttl, max_ttl]`.

use std::sync::Arc;

use http::header::CONTENT_TYPE;
use imgedge_config::{AppConfig, PatternTtl, TtlConfig};
use imgedge_core::{ImageResponse, StorageResult, TransformOptions, header_str};

use crate::cache_control::CacheControl;

pub const MINUTE: u64 = 60;
pub const HOUR: u64 = 60 * MINUTE;
pub const DAY: u64 = 24 * HOUR;
pub const YEAR: u64 = 365 * DAY;

/// Origin `max-age` values outside this band are ignored.
const ORIGIN_MAX_AGE_BAND: std::ops::RangeInclusive<u64> = MINUTE..=YEAR;

const DERIVATIVE_TTLS: &[(&str, u64)] = &[
    ("thumbnail", 14 * DAY),
    ("avatar", 7 * DAY),
    ("profile", 5 * DAY),
    ("preview", 12 * HOUR),
    ("banner", 2 * DAY),
    ("hero", 2 * DAY),
    ("og-image", 30 * DAY),
    ("icon", 30 * DAY),
    ("logo", 30 * DAY),
    ("temp", HOUR),
    ("preview-draft", 5 * MINUTE),
];

const LARGE_IMAGE_PIXELS: u64 = 4_000_000;
const SMALL_IMAGE_PIXELS: u64 = 10_000;

const VOLATILE_PATH_KEYWORDS: &[&str] = &["/news/", "/blog/", "/events/", "/temporary/"];
const STABLE_PATH_KEYWORDS: &[&str] = &["/static/", "/assets/", "/icons/", "/logos/"];

/// Computes a TTL in seconds for a response.
pub trait TtlCalculate: Send + Sync {
    fn calculate_ttl(
        &self,
        response: &ImageResponse,
        options: &TransformOptions,
        storage: Option<&StorageResult>,
    ) -> u64;
}

/// HTTP status category used to pick a TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBucket {
    Ok,
    Redirect,
    ClientError,
    ServerError,
}

impl StatusBucket {
    /// Informational statuses are treated as success.
    pub fn from_status(status: u16) -> Self {
        match status {
            300..=399 => StatusBucket::Redirect,
            400..=499 => StatusBucket::ClientError,
            500..=599 => StatusBucket::ServerError,
            _ => StatusBucket::Ok,
        }
    }

    pub fn select(self, ttl: &TtlConfig) -> u64 {
        match self {
            StatusBucket::Ok => ttl.ok,
            StatusBucket::Redirect => ttl.redirects,
            StatusBucket::ClientError => ttl.client_error,
            StatusBucket::ServerError => ttl.server_error,
        }
    }

    /// Missing buckets fall back to `ok`.
    pub fn select_pattern(self, ttl: &PatternTtl) -> u64 {
        let specific = match self {
            StatusBucket::Ok => None,
            StatusBucket::Redirect => ttl.redirects,
            StatusBucket::ClientError => ttl.client_error,
            StatusBucket::ServerError => ttl.server_error,
        };
        specific.unwrap_or(ttl.ok)
    }
}

/// Content type from the response, else from the storage result.
pub(crate) fn response_content_type<'a>(
    response: &'a ImageResponse,
    storage: Option<&'a StorageResult>,
) -> Option<&'a str> {
    header_str(response.headers(), CONTENT_TYPE)
        .or_else(|| storage.and_then(|s| s.content_type.as_deref()))
}

/// Logical path from the storage result, else from the options.
pub(crate) fn resource_path<'a>(
    options: &'a TransformOptions,
    storage: Option<&'a StorageResult>,
) -> Option<&'a str> {
    storage
        .map(|s| s.path.as_str())
        .filter(|p| !p.is_empty())
        .or(options.path.as_deref())
}

/// Floors and ceilings keyed on content type.
pub fn adjust_for_content_type(ttl: u64, content_type: Option<&str>) -> u64 {
    let Some(content_type) = content_type else {
        return ttl;
    };
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("svg") {
        ttl.max(14 * DAY)
    } else if ct.contains("avif") || ct.contains("webp") {
        ttl.max(7 * DAY)
    } else if ct.contains("video/mp4") {
        ttl.max(3 * DAY)
    } else if ct.contains("video/webm") {
        ttl.max(5 * DAY)
    } else if ct.contains("gif") {
        ttl.min(3 * DAY)
    } else {
        ttl
    }
}

pub fn derivative_ttl(derivative: &str) -> Option<u64> {
    DERIVATIVE_TTLS
        .iter()
        .find(|(name, _)| *name == derivative)
        .map(|(_, ttl)| *ttl)
}

/// Clamp to the configured global bounds.
pub fn clamp_ttl(ttl: u64, min_ttl: Option<u64>, max_ttl: Option<u64>) -> u64 {
    let ttl = min_ttl.map_or(ttl, |min| ttl.max(min));
    max_ttl.map_or(ttl, |max| ttl.min(max))
}

/// Status and heuristic based TTL calculator.
pub struct TtlCalculator {
    config: Arc<AppConfig>,
}

impl TtlCalculator {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    fn success_heuristics(
        &self,
        mut ttl: u64,
        response: &ImageResponse,
        options: &TransformOptions,
        storage: Option<&StorageResult>,
    ) -> u64 {
        let cache = &self.config.cache;

        if let Some(origin_max_age) = CacheControl::from_headers(response.headers())
            .and_then(|cc| cc.max_age())
            .filter(|n| ORIGIN_MAX_AGE_BAND.contains(n))
        {
            ttl = ttl.min(origin_max_age);
        }

        ttl = adjust_for_content_type(ttl, response_content_type(response, storage));

        if let Some(derivative) = options.derivative.as_deref() {
            if let Some(d) = derivative_ttl(derivative) {
                tracing::debug!(derivative, ttl = d, "derivative TTL override");
                ttl = d;
            }
        }

        if let Some(pixels) = storage.and_then(StorageResult::pixel_count) {
            if pixels > LARGE_IMAGE_PIXELS {
                ttl = ttl.min(3 * DAY);
            } else if pixels < SMALL_IMAGE_PIXELS {
                ttl = ttl.max(14 * DAY);
            }
        }

        if let Some(quality) = options.quality {
            if quality >= 90 {
                ttl = ttl.min(5 * DAY);
            } else if quality <= 60 {
                ttl = ttl.max(7 * DAY);
            }
        }

        if let Some(path) = resource_path(options, storage) {
            if let Some((pattern, override_ttl)) = cache
                .path_based_ttl
                .iter()
                .find(|(pattern, _)| path.contains(pattern.as_str()))
            {
                tracing::debug!(path, pattern = %pattern, ttl = override_ttl, "path TTL override");
                ttl = *override_ttl;
            }

            if VOLATILE_PATH_KEYWORDS.iter().any(|k| path.contains(k)) {
                ttl = ttl.min(DAY);
            } else if STABLE_PATH_KEYWORDS.iter().any(|k| path.contains(k)) {
                ttl = ttl.max(30 * DAY);
            }
        }

        ttl
    }
}

impl TtlCalculate for TtlCalculator {
    fn calculate_ttl(
        &self,
        response: &ImageResponse,
        options: &TransformOptions,
        storage: Option<&StorageResult>,
    ) -> u64 {
        let cache = &self.config.cache;
        let bucket = StatusBucket::from_status(response.status().as_u16());
        let mut ttl = bucket.select(&cache.ttl);

        if bucket == StatusBucket::Ok {
            ttl = self.success_heuristics(ttl, response, options, storage);
        }

        clamp_ttl(ttl, cache.min_ttl, cache.max_ttl)
    }
}
