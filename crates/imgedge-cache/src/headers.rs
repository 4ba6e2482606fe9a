//! `Cache-Control`, `Vary` and `Cache-Tag` synthesis.

use std::sync::{Arc, LazyLock};

use http::header::{CACHE_CONTROL, VARY};
use http::{HeaderMap, HeaderValue};
use imgedge_config::{AppConfig, CacheMethod};
use imgedge_core::{ImageRequest, ImageResponse, StorageResult, TransformOptions};
use regex::Regex;
use tracing::{debug, warn};

use crate::tags::{TagGenerator, attach_tag_header, tags_in_response_header};
use crate::ttl::{TtlCalculate, resource_path, response_content_type};

pub const PROCESSED_MARKER_HEADER: &str = "x-img-resizer-processed";
pub const WORKER_MARKER_HEADER: &str = "cf-worker";
pub const WORKER_MARKER_VALUE: &str = "image-resizer";

const CLIENT_HINT_HEADERS: &[&str] = &["Sec-CH-DPR", "DPR", "Sec-CH-Width", "Viewport-Width"];

static VERSIONED_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/v\d+(\.\d+)*/").expect("valid version regex"));
static HASHED_FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.-][a-fA-F0-9]{8,}\.[A-Za-z0-9]+$").expect("valid hash regex"));

/// Stamps caching headers on a response.
pub trait ApplyCacheHeaders: Send + Sync {
    fn apply_cache_headers(
        &self,
        request: &ImageRequest,
        response: ImageResponse,
        options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
    ) -> ImageResponse;
}

pub struct CacheHeadersManager {
    config: Arc<AppConfig>,
    ttl: Arc<dyn TtlCalculate>,
    tags: Option<Arc<dyn TagGenerator>>,
}

impl CacheHeadersManager {
    pub fn new(
        config: Arc<AppConfig>,
        ttl: Arc<dyn TtlCalculate>,
        tags: Option<Arc<dyn TagGenerator>>,
    ) -> Self {
        Self { config, ttl, tags }
    }

    /// Whether content never changes under its URL.
    ///
    /// Immutable when the content type or derivative is configured as such,
    /// when the path carries a version segment (`/v2/`, `/v1.4/`), or when a
    /// hashed filename (`app.a1b2c3d4.js`) sits under an immutable prefix.
    pub fn is_immutable_content(
        &self,
        content_type: Option<&str>,
        path: Option<&str>,
        options: Option<&TransformOptions>,
    ) -> bool {
        let rules = &self.config.cache.immutable_content;
        if !rules.enabled {
            return false;
        }

        if let Some(ct) = content_type {
            let essence = ct.split(';').next().unwrap_or(ct).trim();
            if rules.content_types.iter().any(|t| t.eq_ignore_ascii_case(essence)) {
                return true;
            }
        }

        if let Some(derivative) = options.and_then(|o| o.derivative.as_deref()) {
            if rules.derivatives.iter().any(|d| d == derivative) {
                return true;
            }
        }

        let Some(path) = path else {
            return false;
        };
        if VERSIONED_PATH.is_match(path) {
            return true;
        }
        HASHED_FILENAME.is_match(path)
            && rules.paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn cache_control_for(
        &self,
        status: u16,
        ttl: u64,
        immutable: bool,
    ) -> Option<String> {
        let cache = &self.config.cache;
        match status {
            200..=299 => {
                let mut value = format!("public, max-age={ttl}");
                if cache.enable_stale_while_revalidate {
                    value.push_str(&format!(", stale-while-revalidate={}", ttl / 2));
                }
                if immutable {
                    value.push_str(", immutable");
                }
                let cdn = &cache.cdn_directives;
                if cdn.enabled {
                    if cdn.no_transform {
                        value.push_str(", no-transform");
                    }
                    if cdn.stale_if_error {
                        value.push_str(&format!(", stale-if-error={}", cdn.stale_if_error_time));
                    }
                }
                Some(value)
            }
            300..=399 => Some(format!("public, max-age={ttl}")),
            404 if self.config.environment.is_development() => Some("no-store".to_string()),
            400..=599 => Some(format!("private, max-age={ttl}")),
            _ => None,
        }
    }

    fn vary_for(&self, headers: &HeaderMap, options: Option<&TransformOptions>) -> String {
        let cache = &self.config.cache;
        let mut vary: Vec<String> = headers
            .get_all(VARY)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if vary.iter().any(|v| v == "*") {
            return "*".to_string();
        }

        let mut add = |name: &str| {
            if !vary.iter().any(|v| v.eq_ignore_ascii_case(name)) {
                vary.push(name.to_string());
            }
        };
        add("Accept");
        if cache.vary_on_client_hints {
            for hint in CLIENT_HINT_HEADERS {
                add(hint);
            }
        }
        if cache.vary_on_user_agent {
            add("User-Agent");
        }
        if cache.vary_on_save_data {
            add("Save-Data");
        }
        if options.is_some_and(TransformOptions::is_auto_format) {
            add("Accept");
        }
        vary.join(", ")
    }
}

impl ApplyCacheHeaders for CacheHeadersManager {
    fn apply_cache_headers(
        &self,
        request: &ImageRequest,
        response: ImageResponse,
        options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
    ) -> ImageResponse {
        let cache = &self.config.cache;
        if !cache.cacheability {
            return response;
        }

        let default_options = TransformOptions::default();
        let opts = options.unwrap_or(&default_options);
        let ttl = self.ttl.calculate_ttl(&response, opts, storage);
        let status = response.status().as_u16();
        let path = resource_path(opts, storage).map(str::to_string);
        let immutable = self.is_immutable_content(
            response_content_type(&response, storage),
            path.as_deref(),
            options,
        );

        let mut response = response;
        let cache_control = self.cache_control_for(status, ttl, immutable);
        let vary = self.vary_for(response.headers(), options);
        let headers = response.headers_mut();

        if let Some(value) = cache_control {
            match HeaderValue::from_str(&value) {
                Ok(v) => {
                    headers.insert(CACHE_CONTROL, v);
                }
                Err(e) => warn!(error = %e, "invalid cache-control value"),
            }
        }

        if cache.method == CacheMethod::Cf {
            headers.insert(PROCESSED_MARKER_HEADER, HeaderValue::from_static("true"));
            headers.insert(WORKER_MARKER_HEADER, HeaderValue::from_static(WORKER_MARKER_VALUE));
        }

        match HeaderValue::from_str(&vary) {
            Ok(v) => {
                headers.insert(VARY, v);
            }
            Err(e) => warn!(error = %e, "invalid vary value"),
        }

        debug!(status, ttl, immutable, path = path.as_deref(), "cache headers applied");

        // Under `cf` the tags go out with the fetch directives instead
        if !cache.cache_tags.enabled || !tags_in_response_header(cache) {
            return response;
        }
        let (Some(generator), Some(storage)) = (&self.tags, storage) else {
            return response;
        };
        match generator.generate_cache_tags(request, storage, opts) {
            Ok(tags) => attach_tag_header(response, &tags, cache.use_multiple_cache_tag_headers),
            Err(e) => {
                warn!(path = %storage.path, error = %e, "cache tag generation failed, continuing without tags");
                response
            }
        }
    }
}
