//! Top-level cache orchestration.
//!
//! [`CacheFallbackManager::cache_with_fallback`] always returns a response
//! with cache headers. Edge cache writes, transform-store writes, hints and
//! metrics are side effects that may each fail on their own without
//! affecting what the client receives.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::header::{AGE, CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};
use imgedge_config::{AppConfig, CacheMethod, CircuitBreakerConfig};
use imgedge_core::{
    CacheError, ExecutionContext, ImageRequest, ImageResponse, StorageResult, TaskRunner,
    TransformOptions, header_str,
};
use tracing::{debug, info, warn};

use crate::bypass::{CacheBypassManager, client_requests_fresh};
use crate::circuit_breaker::CircuitBreaker;
use crate::headers::ApplyCacheHeaders;
use crate::metrics;
use crate::performance::CachePerformanceManager;
use crate::resilience::{CACHE_STATUS_HEADER, CacheResilienceManager, classify_store_error};
use crate::store::{TransformCacheEntry, TransformCacheStore, TransformMetadata, transform_cache_key};
use crate::tags::TagGenerator;

/// Breakers shared by every request, one per edge operation class.
#[derive(Debug, Clone)]
pub struct CircuitBreakers {
    pub read: Arc<CircuitBreaker>,
    pub write: Arc<CircuitBreaker>,
}

impl CircuitBreakers {
    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self {
            read: Arc::new(CircuitBreaker::from_config("cache-match", config)),
            write: Arc::new(CircuitBreaker::from_config("cache-put", config)),
        }
    }
}

pub struct CacheFallbackManager {
    config: Arc<AppConfig>,
    bypass: Arc<CacheBypassManager>,
    headers: Arc<dyn ApplyCacheHeaders>,
    resilience: Arc<CacheResilienceManager>,
    performance: Arc<CachePerformanceManager>,
    tags: Arc<dyn TagGenerator>,
    transform_store: Option<Arc<dyn TransformCacheStore>>,
    breakers: CircuitBreakers,
}

impl CacheFallbackManager {
    pub fn new(
        config: Arc<AppConfig>,
        bypass: Arc<CacheBypassManager>,
        headers: Arc<dyn ApplyCacheHeaders>,
        resilience: Arc<CacheResilienceManager>,
        performance: Arc<CachePerformanceManager>,
        tags: Arc<dyn TagGenerator>,
    ) -> Self {
        let breakers = CircuitBreakers::from_config(&config.cache.resilience.circuit_breaker);
        Self {
            config,
            bypass,
            headers,
            resilience,
            performance,
            tags,
            transform_store: None,
            breakers,
        }
    }

    pub fn with_transform_store(mut self, store: Arc<dyn TransformCacheStore>) -> Self {
        self.transform_store = Some(store);
        self
    }

    pub fn with_breakers(mut self, breakers: CircuitBreakers) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Cache a transformed response and return what the client should see.
    pub async fn cache_with_fallback(
        &self,
        request: &ImageRequest,
        response: ImageResponse,
        ctx: Option<&ExecutionContext>,
        options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
    ) -> ImageResponse {
        let cache = &self.config.cache;
        self.store_transformed(request, &response, ctx, options, storage)
            .await;

        let response = self
            .cache_primary(request, response, ctx, options, storage)
            .await;

        let response = if cache.enable_resource_hints {
            self.performance
                .add_resource_hints(response, request, options, storage)
        } else {
            response
        };

        if cache.enable_cache_metrics {
            let metric = self.performance.cache_metric(request, &response);
            TaskRunner::select(ctx)
                .run("cache-metric", async move { metric.record() })
                .await;
        }
        response
    }

    async fn cache_primary(
        &self,
        request: &ImageRequest,
        response: ImageResponse,
        ctx: Option<&ExecutionContext>,
        options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
    ) -> ImageResponse {
        let cache = &self.config.cache;
        if !cache.cacheability {
            debug!("cacheability disabled, returning response unchanged");
            return response;
        }

        match self.bypass.should_bypass_cache(request, options) {
            Ok(true) => return self.bypass_response(request, response, options, storage),
            Ok(false) => {}
            Err(e) => return self.fallback(request, response, options, storage, &e),
        }

        if cache.method != CacheMethod::CacheApi {
            return self.headers.apply_cache_headers(request, response, options, storage);
        }

        match self
            .try_primary(request, response.clone(), ctx, options, storage)
            .await
        {
            Ok(cached) => cached,
            Err(e) => self.fallback(request, response, options, storage, &e),
        }
    }

    async fn try_primary(
        &self,
        request: &ImageRequest,
        response: ImageResponse,
        ctx: Option<&ExecutionContext>,
        options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
    ) -> Result<ImageResponse, CacheError> {
        let cache = &self.config.cache;
        if !self.resilience.has_store() {
            return Err(CacheError::unavailable("edge cache store is not bound"));
        }

        if cache.enable_stale_while_revalidate {
            if let Some(stale) = self
                .resilience
                .try_get_stale_response(request, &self.breakers.read)
                .await
            {
                if let Some(ctx) = ctx {
                    ctx.breadcrumb("cache", "served stale response", None);
                }
                self.resilience
                    .revalidate_in_background(request, response, ctx, options, storage, &self.breakers.write)
                    .await;
                return Ok(stale);
            }
        }

        if cache.enable_background_caching && TaskRunner::select(ctx).is_background() {
            let stamped = self.headers.apply_cache_headers(request, response, options, storage);
            if !stamped.status().is_success() {
                return Ok(stamped);
            }
            let prepared = self
                .resilience
                .prepare_cacheable_response(request, stamped, options, storage);
            self.resilience
                .store_in_cache_background(request, prepared.clone(), ctx, &self.breakers.write)
                .await;
            return Ok(prepared);
        }

        self.resilience
            .cache_with_cache_api(request, response, None, options, storage, &self.breakers.write)
            .await
    }

    /// Headers only, no edge write.
    fn fallback(
        &self,
        request: &ImageRequest,
        response: ImageResponse,
        options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
        err: &CacheError,
    ) -> ImageResponse {
        metrics::record_fallback(err.code());
        if err.reduce_caching() {
            warn!(code = err.code(), error = %err, "cache quota exceeded, serving uncached response; reduce caching");
        } else {
            warn!(code = err.code(), error = %err, "primary caching failed, serving uncached response");
        }
        self.headers.apply_cache_headers(request, response, options, storage)
    }

    fn bypass_response(
        &self,
        request: &ImageRequest,
        response: ImageResponse,
        options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
    ) -> ImageResponse {
        let mut response = self.headers.apply_cache_headers(request, response, options, storage);
        let headers = response.headers_mut();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("BYPASS"));
        response
    }

    /// Persist the transformed bytes for later requests, whatever the client's
    /// `Cache-Control` says.
    async fn store_transformed(
        &self,
        request: &ImageRequest,
        response: &ImageResponse,
        ctx: Option<&ExecutionContext>,
        options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
    ) {
        let transform = &self.config.cache.transform_cache;
        if !transform.enabled {
            return;
        }
        let Some(store) = self.transform_store.clone() else {
            debug!(binding = %transform.binding, "transform store not bound");
            return;
        };
        let (Some(options), Some(storage)) = (options, storage) else {
            return;
        };
        match self.bypass.should_bypass_kv_transform_cache(request, Some(options)) {
            Ok(false) => {}
            Ok(true) => return,
            Err(e) => {
                warn!(error = %e, "transform store bypass check failed, not storing");
                return;
            }
        }
        if !response.status().is_success() {
            return;
        }

        let content_type = header_str(response.headers(), CONTENT_TYPE)
            .map(str::to_string)
            .or_else(|| storage.content_type.clone());
        let Some(content_type) =
            content_type.filter(|ct| ct.starts_with("image/") || ct.starts_with("video/"))
        else {
            debug!(path = %storage.path, "not an image or video, skipping transform store");
            return;
        };
        let size = response.body().len() as u64;
        if size > transform.max_size {
            debug!(path = %storage.path, size, max_size = transform.max_size, "transform result too large to store");
            return;
        }
        if client_requests_fresh(request) {
            info!(path = %storage.path, "client sent no-cache, storing transform result for later requests anyway");
        }

        let key = transform_cache_key(&transform.key_prefix, &storage.path, options);
        let tags = if self.config.cache.cache_tags.enabled {
            self.tags
                .generate_cache_tags(request, storage, options)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "cache tag generation failed for transform entry");
                    Vec::new()
                })
        } else {
            Vec::new()
        };
        let entry = TransformCacheEntry {
            body: response.body().clone(),
            metadata: TransformMetadata {
                content_type,
                path: storage.path.clone(),
                source_type: storage.source_type,
                width: storage.width.or(options.width),
                height: storage.height.or(options.height),
                format: options.format.clone(),
                size,
                stored_at: unix_now(),
                ttl: transform.ttl,
                tags,
            },
        };
        let ttl = Duration::from_secs(transform.ttl);
        if let Some(ctx) = ctx {
            ctx.breadcrumb(
                "cache",
                "transform store write scheduled",
                Some(serde_json::json!({ "key": key, "size": size })),
            );
        }

        TaskRunner::select(ctx)
            .run("transform-cache-put", async move {
                let started = Instant::now();
                match store.put(&key, entry, ttl).await {
                    Ok(()) => {
                        metrics::record_store_operation("transform", "ok", started.elapsed());
                        debug!(key = %key, "stored transform result");
                    }
                    Err(e) => {
                        metrics::record_store_operation("transform", "error", started.elapsed());
                        warn!(key = %key, error = %e, "transform store write failed");
                    }
                }
            })
            .await;
    }

    /// A previously stored transform of `path`, rebuilt as a response.
    pub async fn lookup_transformed(
        &self,
        request: &ImageRequest,
        path: &str,
        options: &TransformOptions,
    ) -> Option<ImageResponse> {
        let transform = &self.config.cache.transform_cache;
        if !transform.enabled {
            return None;
        }
        let store = self.transform_store.as_ref()?;
        match self.bypass.should_bypass_kv_transform_cache(request, Some(options)) {
            Ok(false) => {}
            Ok(true) => return None,
            Err(e) => {
                warn!(error = %e, "transform store bypass check failed");
                return None;
            }
        }

        let key = transform_cache_key(&transform.key_prefix, path, options);
        let started = Instant::now();
        let entry = match store.get(&key).await {
            Ok(Some(entry)) => {
                metrics::record_store_operation("transform", "hit", started.elapsed());
                entry
            }
            Ok(None) => {
                metrics::record_store_operation("transform", "miss", started.elapsed());
                return None;
            }
            Err(e) => {
                metrics::record_store_operation("transform", "error", started.elapsed());
                warn!(key = %key, error = %e, "transform store read failed");
                return None;
            }
        };

        let response = rebuild_response(entry.body, &entry.metadata)?;
        let mut storage = StorageResult::new(&entry.metadata.path, entry.metadata.source_type)
            .with_content_type(&entry.metadata.content_type)
            .with_size(entry.metadata.size);
        if let (Some(w), Some(h)) = (entry.metadata.width, entry.metadata.height) {
            storage = storage.with_dimensions(w, h);
        }
        debug!(key = %key, "transform store hit");
        Some(self.headers.apply_cache_headers(request, response, Some(options), Some(&storage)))
    }

    /// Remove a stored transform. `Ok(false)` when nothing was stored.
    pub async fn invalidate_transformed(
        &self,
        path: &str,
        options: &TransformOptions,
    ) -> Result<bool, CacheError> {
        let transform = &self.config.cache.transform_cache;
        let store = self
            .transform_store
            .as_ref()
            .ok_or_else(|| CacheError::unavailable(format!("transform store '{}' is not bound", transform.binding)))?;
        let key = transform_cache_key(&transform.key_prefix, path, options);
        let removed = store
            .delete(&key)
            .await
            .map_err(|e| classify_store_error("transform-delete", e))?;
        info!(key = %key, removed, "transform store entry invalidated");
        Ok(removed)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn rebuild_response(body: Bytes, metadata: &TransformMetadata) -> Option<ImageResponse> {
    let age = unix_now().saturating_sub(metadata.stored_at);
    let built = http::Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, &metadata.content_type)
        .header(AGE, age.to_string())
        .header(CACHE_STATUS_HEADER, "HIT")
        .body(body);
    match built {
        Ok(response) => Some(response),
        Err(e) => {
            warn!(path = %metadata.path, error = %e, "stored transform has invalid metadata");
            None
        }
    }
}
