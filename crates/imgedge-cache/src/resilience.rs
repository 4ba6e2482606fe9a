//! Resilient edge cache I/O.
//!
//! Every store interaction runs inside [`with_resilience`]: the breaker is
//! consulted before each attempt, store errors are classified into
//! [`CacheError`], and retryable failures back off exponentially with jitter.
//! Writes prefer the background runner; stale reads never fail.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use http::HeaderValue;
use http::header::{AGE, DATE, SET_COOKIE};
use imgedge_config::{AppConfig, CacheMethod, RetryConfig};
use imgedge_core::{
    CacheError, ExecutionContext, ImageRequest, ImageResponse, StorageResult, TaskRunner,
    TransformOptions, header_str, request_url,
};
use rand::Rng;
use tracing::{debug, warn};

use crate::cache_control::CacheControl;
use crate::circuit_breaker::CircuitBreaker;
use crate::headers::ApplyCacheHeaders;
use crate::metrics;
use crate::store::{EdgeCacheStore, StoreError};
use crate::tags::{TagGenerator, attach_tag_header};

pub const CACHE_STATUS_HEADER: &str = "x-cache-status";
pub const STALE_AGE_HEADER: &str = "x-stale-age";

/// Map a store failure onto the cache error taxonomy.
pub fn classify_store_error(operation: &str, err: StoreError) -> CacheError {
    match err {
        StoreError::Unavailable(msg) => CacheError::unavailable(msg),
        StoreError::QuotaExceeded(msg) => CacheError::quota_exceeded(operation, msg),
        StoreError::Backend(msg) => CacheError::write(operation, msg),
    }
}

/// Delay before retry number `attempt` (1-based), jittered by `retry.jitter`.
pub fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16) as i32;
    let base = (retry.initial_delay_ms as f64 * retry.backoff_factor.powi(exponent))
        .min(retry.max_delay_ms as f64);
    let jitter = retry.jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        1.0
    };
    Duration::from_millis((base * factor).max(0.0).round() as u64)
}

/// Run `op` under `breaker` with retries.
///
/// An open breaker fails fast with `CircuitOpen`. Only write errors are
/// retried; every failure counts against the breaker.
pub async fn with_resilience<T, F, Fut>(
    operation: &str,
    key: &str,
    breaker: &CircuitBreaker,
    retry: &RetryConfig,
    mut op: F,
) -> Result<T, CacheError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        breaker.try_acquire()?;
        let started = Instant::now();
        match op().await {
            Ok(value) => {
                breaker.record_success();
                metrics::record_store_operation("edge", "ok", started.elapsed());
                return Ok(value);
            }
            Err(e) => {
                breaker.record_failure();
                metrics::record_store_operation("edge", "error", started.elapsed());
                let err = classify_store_error(operation, e);
                if !err.is_retryable() || attempt >= max_attempts {
                    warn!(operation, key, attempt, code = err.code(), error = %err, "cache operation failed");
                    return Err(err);
                }
                let delay = backoff_delay(retry, attempt);
                debug!(operation, key, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying cache operation");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Edge cache key for a request: its full URL.
pub fn cache_key(request: &ImageRequest) -> String {
    match request_url(request) {
        Ok(url) => url.to_string(),
        Err(_) => request.uri().to_string(),
    }
}

/// Seconds since `Date` and seconds past `max-age`, when a stored response
/// is expired but still inside its `stale-while-revalidate` window.
pub fn stale_age(response: &ImageResponse, now: SystemTime) -> Option<(u64, u64)> {
    let cc = CacheControl::from_headers(response.headers())?;
    let max_age = cc.max_age()?;
    let swr = cc.stale_while_revalidate().filter(|s| *s > 0)?;
    let date = header_str(response.headers(), DATE)
        .and_then(|d| httpdate::parse_http_date(d).ok())?;
    let age = now.duration_since(date).ok()?.as_secs();
    if age <= max_age || age > max_age.saturating_add(swr) {
        return None;
    }
    Some((age, age - max_age))
}

pub struct CacheResilienceManager {
    config: Arc<AppConfig>,
    store: Option<Arc<dyn EdgeCacheStore>>,
    headers: Arc<dyn ApplyCacheHeaders>,
    tags: Arc<dyn TagGenerator>,
}

impl CacheResilienceManager {
    pub fn new(
        config: Arc<AppConfig>,
        store: Option<Arc<dyn EdgeCacheStore>>,
        headers: Arc<dyn ApplyCacheHeaders>,
        tags: Arc<dyn TagGenerator>,
    ) -> Self {
        Self {
            config,
            store,
            headers,
            tags,
        }
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    fn require_store(&self) -> Result<Arc<dyn EdgeCacheStore>, CacheError> {
        self.store
            .clone()
            .ok_or_else(|| CacheError::unavailable("edge cache store is not bound"))
    }

    /// Generic retry + breaker envelope using the configured retry policy.
    pub async fn execute_cache_operation<T, F, Fut>(
        &self,
        operation: &str,
        request: &ImageRequest,
        breaker: &CircuitBreaker,
        op: F,
    ) -> Result<T, CacheError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let key = cache_key(request);
        with_resilience(operation, &key, breaker, &self.config.cache.resilience.retry, op).await
    }

    /// Copy of a stamped response ready for the edge store: `Date` set,
    /// tags in `Cache-Tag`, cookies stripped.
    pub fn prepare_cacheable_response(
        &self,
        request: &ImageRequest,
        response: ImageResponse,
        options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
    ) -> ImageResponse {
        let cache = &self.config.cache;
        let mut response = response;
        let headers = response.headers_mut();
        headers.remove(SET_COOKIE);
        if let Ok(date) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
            headers.insert(DATE, date);
        }

        if !cache.cache_tags.enabled {
            return response;
        }
        let Some(storage) = storage else {
            return response;
        };
        let default_options = TransformOptions::default();
        let options = options.unwrap_or(&default_options);
        match self.tags.generate_cache_tags(request, storage, options) {
            Ok(tags) => attach_tag_header(response, &tags, cache.use_multiple_cache_tag_headers),
            Err(e) => {
                warn!(error = %e, "cache tag generation failed, storing without tags");
                response
            }
        }
    }

    /// Stamp headers and store 2xx responses in the edge cache.
    ///
    /// With a background runner the write is scheduled and the response is
    /// returned at once; otherwise the write is awaited and its error returned.
    pub async fn cache_with_cache_api(
        &self,
        request: &ImageRequest,
        response: ImageResponse,
        ctx: Option<&ExecutionContext>,
        options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
        breaker: &Arc<CircuitBreaker>,
    ) -> Result<ImageResponse, CacheError> {
        if self.config.cache.method != CacheMethod::CacheApi {
            return Ok(response);
        }
        let store = self.require_store()?;
        let stamped = self.headers.apply_cache_headers(request, response, options, storage);
        if !stamped.status().is_success() {
            return Ok(stamped);
        }
        let prepared = self.prepare_cacheable_response(request, stamped, options, storage);

        match TaskRunner::select(ctx) {
            TaskRunner::Background(_) => {
                self.store_in_cache_background(request, prepared.clone(), ctx, breaker)
                    .await;
            }
            TaskRunner::Inline => {
                self.execute_cache_operation("cache-put", request, breaker, || {
                    let store = Arc::clone(&store);
                    let key = cache_key(request);
                    let response = prepared.clone();
                    async move { store.put(&key, response).await }
                })
                .await?;
                debug!(key = %cache_key(request), "stored response in edge cache");
            }
        }
        Ok(prepared)
    }

    /// Fire-and-forget write of an already prepared response. Failures are logged.
    pub async fn store_in_cache_background(
        &self,
        request: &ImageRequest,
        response: ImageResponse,
        ctx: Option<&ExecutionContext>,
        breaker: &Arc<CircuitBreaker>,
    ) {
        let Some(store) = self.store.clone() else {
            warn!("edge cache store is not bound, skipping background write");
            return;
        };
        let key = cache_key(request);
        let retry = self.config.cache.resilience.retry.clone();
        let breaker = Arc::clone(breaker);
        if let Some(ctx) = ctx {
            ctx.breadcrumb(
                "cache",
                "edge cache write scheduled",
                Some(serde_json::json!({ "key": key })),
            );
        }

        TaskRunner::select(ctx)
            .run("edge-cache-put", async move {
                let result = with_resilience("cache-put", &key, &breaker, &retry, || {
                    let store = Arc::clone(&store);
                    let key = key.clone();
                    let response = response.clone();
                    async move { store.put(&key, response).await }
                })
                .await;
                match result {
                    Ok(()) => debug!(key = %key, "background edge cache write complete"),
                    Err(e) => warn!(key = %key, code = e.code(), error = %e, "background edge cache write failed"),
                }
            })
            .await;
    }

    /// A stored response that is expired but inside its stale window, annotated
    /// for serving. Every failure reads as `None`.
    pub async fn try_get_stale_response(
        &self,
        request: &ImageRequest,
        breaker: &CircuitBreaker,
    ) -> Option<ImageResponse> {
        let store = self.store.as_ref()?;
        let key = cache_key(request);
        if breaker.try_acquire().is_err() {
            debug!(key = %key, "circuit open, skipping stale lookup");
            return None;
        }
        let stored = match store.lookup(&key).await {
            Ok(found) => {
                breaker.record_success();
                found?
            }
            Err(e) => {
                breaker.record_failure();
                warn!(key = %key, error = %e, "stale lookup failed");
                return None;
            }
        };

        let (age, stale_for) = stale_age(&stored, SystemTime::now())?;
        let mut response = stored;
        let headers = response.headers_mut();
        headers.insert(STALE_AGE_HEADER, HeaderValue::from(stale_for));
        headers.insert(AGE, HeaderValue::from(age));
        headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("stale"));
        debug!(key = %key, age, stale_for, "serving stale response");
        Some(response)
    }

    /// Re-stamp a freshly fetched response and store it in the background.
    pub async fn revalidate_in_background(
        &self,
        request: &ImageRequest,
        response: ImageResponse,
        ctx: Option<&ExecutionContext>,
        options: Option<&TransformOptions>,
        storage: Option<&StorageResult>,
        breaker: &Arc<CircuitBreaker>,
    ) {
        let stamped = self.headers.apply_cache_headers(request, response, options, storage);
        if !stamped.status().is_success() {
            debug!(status = stamped.status().as_u16(), "not revalidating non-success response");
            return;
        }
        let prepared = self.prepare_cacheable_response(request, stamped, options, storage);
        self.store_in_cache_background(request, prepared, ctx, breaker)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::CacheHeadersManager;
    use crate::store::MemoryEdgeCache;
    use crate::tags::{CACHE_TAG_HEADER, CacheTagsManager};
    use crate::ttl::TtlCalculator;
    use async_trait::async_trait;
    use bytes::Bytes;
    use imgedge_core::{SourceType, TrackedTasks};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> Arc<AppConfig> {
        let mut config = AppConfig::default();
        config.cache.method = CacheMethod::CacheApi;
        config.cache.resilience.retry.initial_delay_ms = 1;
        config.cache.resilience.retry.max_delay_ms = 2;
        Arc::new(config)
    }

    fn manager(config: Arc<AppConfig>, store: Option<Arc<dyn EdgeCacheStore>>) -> CacheResilienceManager {
        let ttl = Arc::new(TtlCalculator::new(Arc::clone(&config)));
        let tags: Arc<dyn TagGenerator> = Arc::new(CacheTagsManager::new(Arc::clone(&config)));
        let headers = Arc::new(CacheHeadersManager::new(
            Arc::clone(&config),
            ttl,
            Some(Arc::clone(&tags)),
        ));
        CacheResilienceManager::new(config, store, headers, tags)
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("cache-put", 3, Duration::from_secs(60)))
    }

    fn request() -> ImageRequest {
        http::Request::builder()
            .uri("/img/a.jpg?width=100")
            .header("host", "cdn.example.com")
            .body(())
            .unwrap()
    }

    fn ok_response() -> ImageResponse {
        http::Response::builder()
            .status(200)
            .header("content-type", "image/jpeg")
            .header("set-cookie", "s=1")
            .body(Bytes::from_static(b"jpeg"))
            .unwrap()
    }

    /// Fails the first `failures` writes with a backend error.
    struct FlakyStore {
        failures: usize,
        calls: AtomicUsize,
        inner: MemoryEdgeCache,
    }

    #[async_trait]
    impl EdgeCacheStore for FlakyStore {
        async fn lookup(&self, key: &str) -> Result<Option<ImageResponse>, StoreError> {
            self.inner.lookup(key).await
        }

        async fn put(&self, key: &str, response: ImageResponse) -> Result<(), StoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(StoreError::Backend("timeout".into()));
            }
            self.inner.put(key, response).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }
    }

    #[test]
    fn test_classify_store_error() {
        assert_eq!(classify_store_error("put", StoreError::Unavailable("x".into())).code(), "CACHE_UNAVAILABLE");
        assert_eq!(classify_store_error("put", StoreError::QuotaExceeded("x".into())).code(), "CACHE_QUOTA_EXCEEDED");
        assert_eq!(classify_store_error("put", StoreError::Backend("x".into())).code(), "CACHE_WRITE_ERROR");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 350,
            backoff_factor: 2.0,
            jitter: 0.0,
        };
        assert_eq!(backoff_delay(&retry, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&retry, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&retry, 3), Duration::from_millis(350));

        let jittered = RetryConfig { jitter: 0.5, ..retry };
        let d = backoff_delay(&jittered, 1).as_millis();
        assert!((50..=150).contains(&d));
    }

    #[tokio::test]
    async fn test_retries_write_errors_then_succeeds() {
        let store = Arc::new(FlakyStore {
            failures: 2,
            calls: AtomicUsize::new(0),
            inner: MemoryEdgeCache::new(),
        });
        let manager = manager(config(), Some(store.clone()));
        let out = manager
            .cache_with_cache_api(&request(), ok_response(), None, None, None, &breaker())
            .await
            .unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(out.headers().get(DATE).is_some());
        assert!(out.headers().get(SET_COOKIE).is_none());
        let stored = store.inner.lookup("http://cdn.example.com/img/a.jpg?width=100").await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_exhausted_retries_propagate_and_open_breaker() {
        let store = Arc::new(FlakyStore {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
            inner: MemoryEdgeCache::new(),
        });
        let manager = manager(config(), Some(store.clone()));
        let breaker = breaker();
        let err = manager
            .cache_with_cache_api(&request(), ok_response(), None, None, None, &breaker)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CACHE_WRITE_ERROR");
        assert_eq!(breaker.state(), crate::circuit_breaker::CircuitState::Open);

        let err = manager
            .cache_with_cache_api(&request(), ok_response(), None, None, None, &breaker)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CIRCUIT_OPEN");
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_quota_not_retried() {
        let store = Arc::new(MemoryEdgeCache::with_quota(1));
        let manager = manager(config(), Some(store.clone()));
        let err = manager
            .cache_with_cache_api(&request(), ok_response(), None, None, None, &breaker())
            .await
            .unwrap_err();
        assert!(err.reduce_caching());
    }

    #[tokio::test]
    async fn test_missing_store_is_unavailable() {
        let manager = manager(config(), None);
        let err = manager
            .cache_with_cache_api(&request(), ok_response(), None, None, None, &breaker())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CACHE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_other_methods_are_noop() {
        let mut cfg = AppConfig::default();
        cfg.cache.method = CacheMethod::Cf;
        let manager = manager(Arc::new(cfg), None);
        let out = manager
            .cache_with_cache_api(&request(), ok_response(), None, None, None, &breaker())
            .await
            .unwrap();
        assert!(out.headers().get("cache-control").is_none());
    }

    #[tokio::test]
    async fn test_background_write_returns_immediately() {
        let store = Arc::new(MemoryEdgeCache::new());
        let manager = manager(config(), Some(store.clone()));
        let tasks = TrackedTasks::new();
        let ctx = ExecutionContext::new().with_tasks(Arc::new(tasks.clone()));
        let storage = StorageResult::new("/img/a.jpg", SourceType::R2);

        let out = manager
            .cache_with_cache_api(&request(), ok_response(), Some(&ctx), None, Some(&storage), &breaker())
            .await
            .unwrap();
        tasks.drain().await;

        let stored = store
            .lookup("http://cdn.example.com/img/a.jpg?width=100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.headers().get("cache-control"),
            out.headers().get("cache-control")
        );
        assert!(stored.headers().get(CACHE_TAG_HEADER).is_some());
    }

    #[tokio::test]
    async fn test_non_success_not_stored() {
        let store = Arc::new(MemoryEdgeCache::new());
        let manager = manager(config(), Some(store.clone()));
        let not_found = http::Response::builder().status(404).body(Bytes::new()).unwrap();
        let out = manager
            .cache_with_cache_api(&request(), not_found, None, None, None, &breaker())
            .await
            .unwrap();
        assert_eq!(out.status(), 404);
        assert!(store.is_empty());
    }

    fn stored_at(age: u64, cache_control: &str) -> ImageResponse {
        let date = SystemTime::now() - Duration::from_secs(age);
        http::Response::builder()
            .status(200)
            .header("cache-control", cache_control)
            .header("date", httpdate::fmt_http_date(date))
            .body(Bytes::from_static(b"old"))
            .unwrap()
    }

    #[test]
    fn test_stale_age_window() {
        let now = SystemTime::now();
        let cc = "public, max-age=100, stale-while-revalidate=50";
        assert_eq!(stale_age(&stored_at(50, cc), now), None);
        let (age, stale_for) = stale_age(&stored_at(120, cc), now).unwrap();
        assert!((119..=121).contains(&age));
        assert!((19..=21).contains(&stale_for));
        assert_eq!(stale_age(&stored_at(200, cc), now), None);
        assert_eq!(stale_age(&stored_at(120, "public, max-age=100"), now), None);
        let no_date = http::Response::builder()
            .header("cache-control", cc)
            .body(Bytes::new())
            .unwrap();
        assert_eq!(stale_age(&no_date, now), None);
    }

    #[test]
    fn test_stale_age_huge_window_does_not_overflow() {
        let now = SystemTime::now();
        let cc = format!("max-age=100, stale-while-revalidate={}", u64::MAX);
        let (_, stale_for) = stale_age(&stored_at(120, &cc), now).unwrap();
        assert!((19..=21).contains(&stale_for));
    }

    #[tokio::test]
    async fn test_try_get_stale_response() {
        let store = Arc::new(MemoryEdgeCache::new());
        let key = "http://cdn.example.com/img/a.jpg?width=100";
        store
            .put(key, stored_at(120, "public, max-age=100, stale-while-revalidate=50"))
            .await
            .unwrap();
        let manager = manager(config(), Some(store.clone()));
        let stale = manager
            .try_get_stale_response(&request(), &breaker())
            .await
            .unwrap();
        assert_eq!(stale.headers().get(CACHE_STATUS_HEADER).unwrap(), "stale");
        assert!(stale.headers().get(STALE_AGE_HEADER).is_some());
        assert!(stale.headers().get(AGE).is_some());

        store.put(key, stored_at(10, "public, max-age=100, stale-while-revalidate=50")).await.unwrap();
        assert!(manager.try_get_stale_response(&request(), &breaker()).await.is_none());

        let empty = self::manager(config(), None);
        assert!(empty.try_get_stale_response(&request(), &breaker()).await.is_none());
    }

    #[tokio::test]
    async fn test_revalidate_in_background_replaces_entry() {
        let store = Arc::new(MemoryEdgeCache::new());
        let manager = manager(config(), Some(store.clone()));
        let fresh = http::Response::builder()
            .status(200)
            .header("content-type", "image/jpeg")
            .body(Bytes::from_static(b"new"))
            .unwrap();
        manager
            .revalidate_in_background(&request(), fresh, None, None, None, &breaker())
            .await;
        let stored = store
            .lookup("http://cdn.example.com/img/a.jpg?width=100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.body(), &Bytes::from_static(b"new"));
        assert!(stored.headers().get("cache-control").is_some());
    }
}
