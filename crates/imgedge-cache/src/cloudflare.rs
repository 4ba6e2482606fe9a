//! Edge cache directives for outbound fetches.

use std::sync::Arc;

use http::HeaderMap;
use imgedge_config::{AppConfig, CacheMethod, TtlConfig};
use imgedge_core::TransformOptions;
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::tags::TagGenerator;

/// Per-fetch edge cache settings, serialised in the edge runtime's shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeCacheDirectives {
    pub cache_everything: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<u64>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub cache_ttl_by_status: IndexMap<String, u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cache_tags: Vec<String>,
}

/// Options for an outbound fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub headers: HeaderMap,
    pub cf: Option<EdgeCacheDirectives>,
}

/// Status-range TTL table derived from the bucket TTLs.
pub fn default_ttl_by_status(ttl: &TtlConfig) -> IndexMap<String, u64> {
    IndexMap::from([
        ("200-299".to_string(), ttl.ok),
        ("301-302".to_string(), ttl.redirects),
        ("404".to_string(), ttl.client_error),
        ("500-599".to_string(), ttl.server_error),
    ])
}

pub struct CloudflareCacheManager {
    config: Arc<AppConfig>,
}

impl CloudflareCacheManager {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    /// Attach edge cache directives to `init`. Unchanged unless the method is `cf`.
    pub fn apply_cloudflare_cache(
        &self,
        mut init: FetchOptions,
        path: &str,
        options: &TransformOptions,
        tags: Option<&dyn TagGenerator>,
    ) -> FetchOptions {
        let cache = &self.config.cache;
        if cache.method != CacheMethod::Cf {
            return init;
        }

        let mut directives = init.cf.take().unwrap_or_default();
        directives.cache_everything = cache.cache_everything;

        if cache.use_ttl_by_status {
            directives.cache_ttl = None;
            directives.cache_ttl_by_status = if cache.cache_ttl_by_status.is_empty() {
                default_ttl_by_status(&cache.ttl)
            } else {
                cache.cache_ttl_by_status.clone()
            };
        } else {
            directives.cache_ttl = Some(cache.ttl.ok);
            directives.cache_ttl_by_status.clear();
        }

        if cache.cache_tags.enabled {
            if let Some(generator) = tags {
                match generator.tags_for_path(path, options) {
                    Ok(generated) if !generated.is_empty() => directives.cache_tags = generated,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(path, error = %e, "cache tag generation failed for edge directives")
                    }
                }
            }
        }

        debug!(
            path,
            cache_ttl = ?directives.cache_ttl,
            by_status = directives.cache_ttl_by_status.len(),
            tags = directives.cache_tags.len(),
            "edge cache directives applied"
        );
        init.cf = Some(directives);
        init
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::CacheTagsManager;
    use imgedge_core::CacheError;

    fn manager_with(f: impl FnOnce(&mut AppConfig)) -> (CloudflareCacheManager, CacheTagsManager) {
        let mut config = AppConfig::default();
        f(&mut config);
        let config = Arc::new(config);
        (
            CloudflareCacheManager::new(Arc::clone(&config)),
            CacheTagsManager::new(config),
        )
    }

    #[test]
    fn test_noop_for_other_methods() {
        let (manager, tags) = manager_with(|c| c.cache.method = CacheMethod::CacheApi);
        let out = manager.apply_cloudflare_cache(
            FetchOptions::default(),
            "/a.jpg",
            &TransformOptions::default(),
            Some(&tags),
        );
        assert!(out.cf.is_none());
    }

    #[test]
    fn test_flat_ttl_with_tags() {
        let (manager, tags) = manager_with(|_| {});
        let out = manager.apply_cloudflare_cache(
            FetchOptions::default(),
            "/products/a.jpg",
            &TransformOptions::default(),
            Some(&tags),
        );
        let cf = out.cf.unwrap();
        assert!(cf.cache_everything);
        assert_eq!(cf.cache_ttl, Some(86_400));
        assert!(cf.cache_ttl_by_status.is_empty());
        assert!(cf.cache_tags.contains(&"img-path-products-a-jpg".to_string()));
        assert!(!cf.cache_tags.iter().any(|t| t.starts_with("img-host-")));
    }

    #[test]
    fn test_ttl_by_status_derived_and_serialized() {
        let (manager, _) = manager_with(|c| {
            c.cache.use_ttl_by_status = true;
            c.cache.cache_everything = false;
        });
        let out = manager.apply_cloudflare_cache(
            FetchOptions::default(),
            "/a.jpg",
            &TransformOptions::default(),
            None,
        );
        let cf = out.cf.unwrap();
        assert_eq!(cf.cache_ttl, None);
        assert_eq!(cf.cache_ttl_by_status.get("404"), Some(&60));

        let json = serde_json::to_value(&cf).unwrap();
        assert_eq!(json["cacheEverything"], false);
        assert_eq!(json["cacheTtlByStatus"]["200-299"], 86_400);
        assert!(json.get("cacheTtl").is_none());
        assert!(json.get("cacheTags").is_none());
    }

    struct FailingTags;

    impl TagGenerator for FailingTags {
        fn generate_cache_tags(
            &self,
            _: &imgedge_core::ImageRequest,
            _: &imgedge_core::StorageResult,
            _: &TransformOptions,
        ) -> Result<Vec<String>, CacheError> {
            Err(CacheError::tag_generation("boom"))
        }

        fn tags_for_path(&self, _: &str, _: &TransformOptions) -> Result<Vec<String>, CacheError> {
            Err(CacheError::tag_generation("boom"))
        }
    }

    #[test]
    fn test_tag_failure_is_swallowed() {
        let (manager, _) = manager_with(|_| {});
        let out = manager.apply_cloudflare_cache(
            FetchOptions::default(),
            "/a.jpg",
            &TransformOptions::default(),
            Some(&FailingTags),
        );
        let cf = out.cf.unwrap();
        assert_eq!(cf.cache_ttl, Some(86_400));
        assert!(cf.cache_tags.is_empty());
    }
}
