//! Caching layer for the imgedge image proxy.
//!
//! ## Request flow
//!
//! ```text
//! response ─► bypass? ─► TTL + tags ─► headers ─► edge store (retry + breaker)
//!                │                                   │ failure
//!                │                                   ▼
//!                └──────────────► headers only (fallback) ─► hints + metric
//!
//! in parallel: transformed bytes ─► transform store (ignores client no-cache)
//! ```
//!
//! [`CacheSystem`] wires every manager from one [`AppConfig`] snapshot. The
//! managers can also be built individually; each depends only on the narrow
//! traits ([`TtlCalculate`], [`TagGenerator`], [`ApplyCacheHeaders`]) it calls.

pub mod bypass;
pub mod cache_control;
pub mod circuit_breaker;
pub mod cloudflare;
pub mod fallback;
pub mod headers;
pub mod metrics;
pub mod observability;
pub mod path_pattern;
pub mod performance;
pub mod resilience;
pub mod store;
pub mod tags;
pub mod ttl;

use std::sync::Arc;

use imgedge_config::{AppConfig, PathPattern};
use imgedge_core::{
    CacheError, ExecutionContext, ImageRequest, ImageResponse, StorageResult, TransformOptions,
};
use tracing::info;

pub use bypass::{BypassReason, BypassScope, CacheBypassManager};
pub use cache_control::CacheControl;
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use cloudflare::{CloudflareCacheManager, EdgeCacheDirectives, FetchOptions};
pub use fallback::{CacheFallbackManager, CircuitBreakers};
pub use headers::{ApplyCacheHeaders, CacheHeadersManager};
pub use path_pattern::PathPatternTtlCalculator;
pub use performance::{CacheMetric, CachePerformanceManager};
pub use resilience::{CacheResilienceManager, with_resilience};
pub use store::{
    EdgeCacheStore, MemoryEdgeCache, MemoryTransformStore, StoreError, TransformCacheEntry,
    TransformCacheStore, TransformMetadata, transform_cache_key,
};
pub use tags::{CACHE_TAG_HEADER, CacheTagsManager, RequestCacheTags, TagGenerator};
pub use ttl::{TtlCalculate, TtlCalculator};

/// Every cache manager built from one configuration snapshot.
pub struct CacheSystem {
    config: Arc<AppConfig>,
    ttl: Arc<dyn TtlCalculate>,
    path_patterns: Option<Arc<PathPatternTtlCalculator>>,
    tags: Arc<CacheTagsManager>,
    bypass: Arc<CacheBypassManager>,
    headers: Arc<CacheHeadersManager>,
    cloudflare: CloudflareCacheManager,
    resilience: Arc<CacheResilienceManager>,
    performance: Arc<CachePerformanceManager>,
    fallback: CacheFallbackManager,
}

#[derive(Default)]
pub struct CacheSystemBuilder {
    config: Arc<AppConfig>,
    edge_store: Option<Arc<dyn EdgeCacheStore>>,
    transform_store: Option<Arc<dyn TransformCacheStore>>,
    breakers: Option<CircuitBreakers>,
}

impl CacheSystemBuilder {
    pub fn edge_store(mut self, store: Arc<dyn EdgeCacheStore>) -> Self {
        self.edge_store = Some(store);
        self
    }

    pub fn transform_store(mut self, store: Arc<dyn TransformCacheStore>) -> Self {
        self.transform_store = Some(store);
        self
    }

    /// Share breakers with another system, e.g. across configuration reloads.
    pub fn breakers(mut self, breakers: CircuitBreakers) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Fails only when every configured path pattern is invalid.
    pub fn build(self) -> Result<CacheSystem, CacheError> {
        let config = self.config;

        let path_patterns = if config.cache.path_patterns.is_empty() {
            None
        } else {
            Some(Arc::new(PathPatternTtlCalculator::new(Arc::clone(&config))?))
        };
        let ttl: Arc<dyn TtlCalculate> = match &path_patterns {
            Some(calculator) => calculator.clone(),
            None => Arc::new(TtlCalculator::new(Arc::clone(&config))),
        };

        let tags = Arc::new(CacheTagsManager::new(Arc::clone(&config)));
        let tag_generator: Arc<dyn TagGenerator> = tags.clone();
        let bypass = Arc::new(CacheBypassManager::new(Arc::clone(&config)));
        let headers = Arc::new(CacheHeadersManager::new(
            Arc::clone(&config),
            Arc::clone(&ttl),
            Some(Arc::clone(&tag_generator)),
        ));
        let header_stamper: Arc<dyn ApplyCacheHeaders> = headers.clone();
        let resilience = Arc::new(CacheResilienceManager::new(
            Arc::clone(&config),
            self.edge_store,
            Arc::clone(&header_stamper),
            Arc::clone(&tag_generator),
        ));
        let performance = Arc::new(CachePerformanceManager::new(Arc::clone(&config)));

        let mut fallback = CacheFallbackManager::new(
            Arc::clone(&config),
            Arc::clone(&bypass),
            header_stamper,
            Arc::clone(&resilience),
            Arc::clone(&performance),
            tag_generator,
        );
        if let Some(store) = self.transform_store {
            fallback = fallback.with_transform_store(store);
        }
        if let Some(breakers) = self.breakers {
            fallback = fallback.with_breakers(breakers);
        }

        info!(
            method = %config.cache.method,
            path_patterns = config.cache.path_patterns.len(),
            edge_store = resilience.has_store(),
            "cache system ready"
        );

        Ok(CacheSystem {
            cloudflare: CloudflareCacheManager::new(Arc::clone(&config)),
            config,
            ttl,
            path_patterns,
            tags,
            bypass,
            headers,
            resilience,
            performance,
            fallback,
        })
    }
}

impl CacheSystem {
    pub fn builder(config: Arc<AppConfig>) -> CacheSystemBuilder {
        CacheSystemBuilder {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    pub fn should_bypass_cache(
        &self,
        request: &ImageRequest,
        options: Option<&TransformOptions>,
    ) -> Result<bool, CacheError> {
        self.bypass.should_bypass_cache(request, options)
    }

    pub fn should_bypass_kv_transform_cache(
        &self,
        request: &ImageRequest,
        options: Option<&TransformOptions>,
    ) -> Result<bool, CacheError> {
        self.bypass.should_bypass_kv_transform_cache(request, options)
    }

    pub fn calculate_ttl(
        &self,
        response: &ImageResponse,
        options: &TransformOptions,
        storage: Option<&StorageResult>,
    ) -> u64 {
        self.ttl.calculate_ttl(response, options, storage)
    }

    pub fn generate_cache_tags(
        &self,
        request: &ImageRequest,
        storage: &StorageResult,
        options: &TransformOptions,
    ) -> Result<Vec<String>, CacheError> {
        self.tags.generate_cache_tags(request, storage, options)
    }

    pub fn apply_cache_headers(
        &self,
        request: &ImageRequest,
        response: ImageResponse,
        options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
    ) -> ImageResponse {
        self.headers.apply_cache_headers(request, response, options, storage)
    }

    pub async fn cache_with_fallback(
        &self,
        request: &ImageRequest,
        response: ImageResponse,
        ctx: Option<&ExecutionContext>,
        options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
    ) -> ImageResponse {
        self.fallback
            .cache_with_fallback(request, response, ctx, options, storage)
            .await
    }

    pub fn apply_cloudflare_cache(
        &self,
        init: FetchOptions,
        path: &str,
        options: &TransformOptions,
    ) -> FetchOptions {
        self.cloudflare
            .apply_cloudflare_cache(init, path, options, Some(self.tags.as_ref()))
    }

    /// Replace the path-pattern table. Only available when patterns were configured.
    pub fn update_patterns(&self, patterns: Vec<PathPattern>) -> Result<(), CacheError> {
        match &self.path_patterns {
            Some(calculator) => calculator.update_patterns(patterns),
            None => Err(CacheError::configuration(
                "path-pattern TTLs are not enabled; configure cache.path_patterns",
            )),
        }
    }

    pub async fn lookup_transformed(
        &self,
        request: &ImageRequest,
        path: &str,
        options: &TransformOptions,
    ) -> Option<ImageResponse> {
        self.fallback.lookup_transformed(request, path, options).await
    }

    pub async fn invalidate_transformed(
        &self,
        path: &str,
        options: &TransformOptions,
    ) -> Result<bool, CacheError> {
        self.fallback.invalidate_transformed(path, options).await
    }

    pub fn tags(&self) -> &CacheTagsManager {
        &self.tags
    }

    pub fn resilience(&self) -> &CacheResilienceManager {
        &self.resilience
    }

    pub fn performance(&self) -> &CachePerformanceManager {
        &self.performance
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        self.fallback.breakers()
    }
}
