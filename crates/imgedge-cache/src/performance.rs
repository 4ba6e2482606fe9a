//! Resource hints and cache hit/miss metrics.

use std::sync::Arc;

use http::HeaderValue;
use http::header::{CONTENT_TYPE, LINK};
use imgedge_config::AppConfig;
use imgedge_core::{ImageRequest, ImageResponse, StorageResult, TransformOptions, header_str};
use indexmap::IndexSet;
use tracing::{info, warn};

use crate::metrics;
use crate::resilience::CACHE_STATUS_HEADER;

const EDGE_STATUS_HEADER: &str = "cf-cache-status";

/// One cache outcome, ready to be recorded off the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMetric {
    pub status: String,
    pub bucket: String,
    pub path: String,
    pub http_status: u16,
    pub content_type: Option<String>,
}

impl CacheMetric {
    pub fn record(&self) {
        metrics::record_cache_request(&self.status, &self.bucket);
        info!(
            cache_status = %self.status,
            bucket = %self.bucket,
            path = %self.path,
            http_status = self.http_status,
            content_type = self.content_type.as_deref().unwrap_or(""),
            "cache metric"
        );
    }
}

pub struct CachePerformanceManager {
    config: Arc<AppConfig>,
}

impl CachePerformanceManager {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    /// Add `Link` preconnect/preload hints to HTML responses, keeping any
    /// existing `Link` entries. Other content types pass through untouched.
    pub fn add_resource_hints(
        &self,
        mut response: ImageResponse,
        request: &ImageRequest,
        _options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
    ) -> ImageResponse {
        let is_html = header_str(response.headers(), CONTENT_TYPE)
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("text/html"));
        if !is_html {
            return response;
        }

        let hints = &self.config.cache.resource_hints;
        let request_path = request.uri().path();
        let storage_path = storage.map(|s| s.path.as_str());

        let mut links: IndexSet<String> = response
            .headers()
            .get_all(LINK)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        let existing = links.len();

        for domain in &hints.preconnect {
            let origin = if domain.contains("://") {
                domain.clone()
            } else {
                format!("https://{domain}")
            };
            links.insert(format!("<{origin}>; rel=preconnect"));
        }
        for (pattern, urls) in &hints.preload_patterns {
            let matched = request_path.contains(pattern.as_str())
                || storage_path.is_some_and(|p| p.contains(pattern.as_str()));
            if matched {
                for url in urls {
                    links.insert(format!("<{url}>; rel=preload; as=image"));
                }
            }
        }

        if links.len() == existing {
            return response;
        }
        let joined = links.into_iter().collect::<Vec<_>>().join(", ");
        match HeaderValue::from_str(&joined) {
            Ok(value) => {
                response.headers_mut().insert(LINK, value);
            }
            Err(e) => warn!(error = %e, "resource hints are not a valid Link header"),
        }
        response
    }

    /// Derive the cache outcome of a served response.
    pub fn cache_metric(&self, request: &ImageRequest, response: &ImageResponse) -> CacheMetric {
        let headers = response.headers();
        let status = header_str(headers, CACHE_STATUS_HEADER)
            .or_else(|| header_str(headers, EDGE_STATUS_HEADER))
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(|| {
                if response.status().is_success() {
                    "MISS".to_string()
                } else {
                    "UNKNOWN".to_string()
                }
            });
        let path = request.uri().path().to_string();
        CacheMetric {
            status,
            bucket: metrics::path_bucket(&path),
            path,
            http_status: response.status().as_u16(),
            content_type: header_str(headers, CONTENT_TYPE).map(str::to_string),
        }
    }

    pub async fn record_cache_metric(&self, request: &ImageRequest, response: &ImageResponse) {
        self.cache_metric(request, response).record();
    }
}
