//! Cache stores: the edge response cache and the transform-result (KV) cache.
//!
//! Both are traits so a host can bind real platform stores; the in-memory
//! implementations back local runs and tests.
//!
//! | Store                | Keyed by                | Holds                     |
//! |----------------------|-------------------------|---------------------------|
//! | [`EdgeCacheStore`]   | full request URL        | complete stamped response |
//! | [`TransformCacheStore`] | [`transform_cache_key`] | body + [`TransformMetadata`] |

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use imgedge_core::{ImageResponse, SourceType, TransformOptions};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Failures reported by a store backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Edge response cache keyed by request URL.
#[async_trait]
pub trait EdgeCacheStore: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Option<ImageResponse>, StoreError>;

    async fn put(&self, key: &str, response: ImageResponse) -> Result<(), StoreError>;

    /// Returns whether an entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// In-process edge cache with an optional byte quota.
#[derive(Default)]
pub struct MemoryEdgeCache {
    entries: DashMap<String, ImageResponse>,
    quota_bytes: Option<usize>,
    used_bytes: AtomicUsize,
}

impl MemoryEdgeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would push total body bytes past `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    /// Drop every entry carrying `tag` in its `Cache-Tag` header.
    pub fn purge_tag(&self, tag: &str) -> usize {
        let before = self.entries.len();
        let mut freed = 0usize;
        self.entries.retain(|_, response| {
            let tagged = response
                .headers()
                .get_all(crate::tags::CACHE_TAG_HEADER)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .any(|t| t.trim() == tag);
            if tagged {
                freed += response.body().len();
            }
            !tagged
        });
        self.used_bytes.fetch_sub(freed, Ordering::Relaxed);
        let purged = before.saturating_sub(self.entries.len());
        tracing::debug!(tag = %tag, purged, "purged edge cache entries by tag");
        purged
    }
}

#[async_trait]
impl EdgeCacheStore for MemoryEdgeCache {
    async fn lookup(&self, key: &str) -> Result<Option<ImageResponse>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, response: ImageResponse) -> Result<(), StoreError> {
        let size = response.body().len();
        let previous = self
            .entries
            .get(key)
            .map(|entry| entry.body().len())
            .unwrap_or(0);

        if let Some(quota) = self.quota_bytes {
            let projected = self.used_bytes().saturating_sub(previous) + size;
            if projected > quota {
                return Err(StoreError::QuotaExceeded(format!(
                    "{projected} bytes exceeds quota of {quota}"
                )));
            }
        }

        self.entries.insert(key.to_string(), response);
        self.used_bytes.fetch_add(size, Ordering::Relaxed);
        self.used_bytes.fetch_sub(previous, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        match self.entries.remove(key) {
            Some((_, response)) => {
                self.used_bytes
                    .fetch_sub(response.body().len(), Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Metadata stored next to a transformed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformMetadata {
    pub content_type: String,
    pub path: String,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub size: u64,
    /// Unix seconds at write time
    pub stored_at: u64,
    pub ttl: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A transformed image as held by the transform store.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformCacheEntry {
    pub body: Bytes,
    pub metadata: TransformMetadata,
}

/// Transform-result cache, independent of the edge cache.
#[async_trait]
pub trait TransformCacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<TransformCacheEntry>, StoreError>;

    async fn put(
        &self,
        key: &str,
        entry: TransformCacheEntry,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredTransform {
    entry: TransformCacheEntry,
    cached_at: Instant,
    ttl: Duration,
}

impl StoredTransform {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// In-process transform store with per-entry expiry.
#[derive(Default)]
pub struct MemoryTransformStore {
    entries: DashMap<String, StoredTransform>,
}

impl MemoryTransformStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl TransformCacheStore for MemoryTransformStore {
    async fn get(&self, key: &str) -> Result<Option<TransformCacheEntry>, StoreError> {
        if let Some(stored) = self.entries.get(key) {
            if !stored.is_expired() {
                return Ok(Some(stored.entry.clone()));
            }
            drop(stored);
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        entry: TransformCacheEntry,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            StoredTransform {
                entry,
                cached_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }
}

/// The option fields that distinguish one transform of a path from another.
#[derive(Serialize)]
struct KeyOptions<'a> {
    width: Option<u32>,
    height: Option<u32>,
    format: Option<&'a str>,
    quality: Option<u8>,
    fit: Option<&'a str>,
    gravity: Option<&'a str>,
    derivative: Option<&'a str>,
    features: &'a [String],
    watermark: Option<&'a str>,
    tenant: Option<&'a str>,
}

/// Key for the transform store: `<prefix>:<path>:<16 hex chars>`.
///
/// The hash covers the canonical JSON of the option fields that change the
/// output, so equal transforms of the same path always share a key.
pub fn transform_cache_key(prefix: &str, path: &str, options: &TransformOptions) -> String {
    let fields = KeyOptions {
        width: options.width,
        height: options.height,
        format: options.format.as_deref(),
        quality: options.quality,
        fit: options.fit.as_deref(),
        gravity: options.gravity.as_deref(),
        derivative: options.derivative.as_deref(),
        features: &options.features,
        watermark: options.watermark.as_deref(),
        tenant: options.tenant.as_deref(),
    };
    let canonical = serde_json::to_vec(&fields).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    let path = path.trim_start_matches('/');
    format!("{prefix}:{path}:{}", hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &'static str, tags: Option<&str>) -> ImageResponse {
        let mut builder = http::Response::builder().status(200);
        if let Some(tags) = tags {
            builder = builder.header("Cache-Tag", tags);
        }
        builder.body(Bytes::from_static(body.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn test_edge_put_lookup_delete() {
        let store = MemoryEdgeCache::new();
        store.put("k", response("abc", None)).await.unwrap();
        assert_eq!(store.used_bytes(), 3);

        let hit = store.lookup("k").await.unwrap().unwrap();
        assert_eq!(hit.body(), &Bytes::from_static(b"abc"));

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.used_bytes(), 0);
        assert!(store.lookup("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_edge_quota_exceeded() {
        let store = MemoryEdgeCache::with_quota(4);
        store.put("a", response("abc", None)).await.unwrap();
        let err = store.put("b", response("de", None)).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded(_)));

        // Replacing an entry only counts the delta
        store.put("a", response("abcd", None)).await.unwrap();
        assert_eq!(store.used_bytes(), 4);
    }

    #[tokio::test]
    async fn test_purge_tag() {
        let store = MemoryEdgeCache::new();
        store
            .put("a", response("1", Some("img-a,img-shared")))
            .await
            .unwrap();
        store.put("b", response("2", Some("img-b"))).await.unwrap();
        assert_eq!(store.purge_tag("img-shared"), 1);
        assert_eq!(store.len(), 1);
        assert!(store.lookup("b").await.unwrap().is_some());
    }

    fn entry() -> TransformCacheEntry {
        TransformCacheEntry {
            body: Bytes::from_static(b"img"),
            metadata: TransformMetadata {
                content_type: "image/webp".into(),
                path: "/a.jpg".into(),
                source_type: SourceType::Remote,
                width: Some(100),
                height: None,
                format: Some("webp".into()),
                size: 3,
                stored_at: 0,
                ttl: 60,
                tags: vec!["img-a".into()],
            },
        }
    }

    #[tokio::test]
    async fn test_transform_store_expiry() {
        let store = MemoryTransformStore::new();
        store
            .put("live", entry(), Duration::from_secs(60))
            .await
            .unwrap();
        store.put("dead", entry(), Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(store.get("live").await.unwrap().is_some());
        assert!(store.get("dead").await.unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_metadata_serializes_camel_case() {
        let json = serde_json::to_value(&entry().metadata).unwrap();
        assert_eq!(json["contentType"], "image/webp");
        assert_eq!(json["storedAt"], 0);
        assert_eq!(json["sourceType"], "remote");
        assert!(json.get("height").is_none());

        let mut legacy = json;
        legacy.as_object_mut().unwrap().remove("sourceType");
        let parsed: TransformMetadata = serde_json::from_value(legacy).unwrap();
        assert_eq!(parsed.source_type, SourceType::R2);
    }

    #[test]
    fn test_transform_key_shape_and_stability() {
        let options = TransformOptions {
            width: Some(800),
            format: Some("webp".into()),
            ..Default::default()
        };
        let key = transform_cache_key("transform", "/products/shoe.jpg", &options);
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts[0], "transform");
        assert_eq!(parts[1], "products/shoe.jpg");
        assert_eq!(parts[2].len(), 16);
        assert_eq!(
            key,
            transform_cache_key("transform", "products/shoe.jpg", &options)
        );

        let other = TransformOptions {
            width: Some(400),
            ..options.clone()
        };
        assert_ne!(key, transform_cache_key("transform", "/products/shoe.jpg", &other));

        let tenant = TransformOptions {
            tenant: Some("acme".into()),
            ..options
        };
        assert_ne!(key, transform_cache_key("transform", "/products/shoe.jpg", &tenant));
    }
}
