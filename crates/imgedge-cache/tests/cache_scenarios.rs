//! End-to-end behaviour of the cache system through its facade.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::CACHE_CONTROL;
use imgedge_cache::{
    CACHE_TAG_HEADER, CacheSystem, EdgeCacheStore, MemoryEdgeCache, MemoryTransformStore,
};
use imgedge_config::{AppConfig, CacheMethod, PathPattern, PatternTtl};
use imgedge_core::{
    ExecutionContext, ImageRequest, ImageResponse, SourceType, StorageResult, TrackedTasks,
    TransformOptions,
};

fn request(uri: &str, headers: &[(&str, &str)]) -> ImageRequest {
    let mut builder = http::Request::builder()
        .uri(uri)
        .header("host", "cdn.example.com");
    for (k, v) in headers {
        builder = builder.header(*k, *v);
    }
    builder.body(()).unwrap()
}

fn response(content_type: &str) -> ImageResponse {
    http::Response::builder()
        .status(200)
        .header("content-type", content_type)
        .body(Bytes::from_static(b"image-bytes"))
        .unwrap()
}

fn pattern(name: &str, matcher: &str, ok: u64, priority: i32) -> PathPattern {
    PathPattern {
        name: name.into(),
        matcher: matcher.into(),
        ttl: PatternTtl::uniform(ok),
        priority,
        description: None,
    }
}

fn system(f: impl FnOnce(&mut AppConfig)) -> CacheSystem {
    let mut config = AppConfig::default();
    f(&mut config);
    CacheSystem::builder(Arc::new(config)).build().unwrap()
}

#[test]
fn test_priority_pattern_wins_over_default() {
    let system = system(|c| {
        c.cache.path_patterns = vec![
            pattern("default", ".*", 300, 0),
            pattern("images", "^/img/", 3600, 10),
        ];
    });
    let storage = StorageResult::new("/img/photo.jpg", SourceType::R2);
    let options = TransformOptions {
        width: Some(800),
        ..Default::default()
    };
    assert_eq!(
        system.calculate_ttl(&response("image/jpeg"), &options, Some(&storage)),
        3600
    );

    let other = StorageResult::new("/docs/a.jpg", SourceType::R2);
    assert_eq!(
        system.calculate_ttl(&response("image/jpeg"), &options, Some(&other)),
        300
    );
}

#[test]
fn test_update_patterns_takes_effect_immediately() {
    let system = system(|c| {
        c.cache.path_patterns = vec![
            pattern("default", ".*", 300, 0),
            pattern("images", "^/img/", 3600, 10),
        ];
    });
    let storage = StorageResult::new("/img/photo.jpg", SourceType::R2);
    let options = TransformOptions::default();

    system
        .update_patterns(vec![
            pattern("default", ".*", 300, 0),
            pattern("images", "^/img/", 120, 10),
        ])
        .unwrap();
    assert_eq!(
        system.calculate_ttl(&response("image/jpeg"), &options, Some(&storage)),
        120
    );

    assert!(system.update_patterns(vec![pattern("bad", "([", 1, 1)]).is_err());
    assert_eq!(
        system.calculate_ttl(&response("image/jpeg"), &options, Some(&storage)),
        120
    );
}

#[test]
fn test_svg_gets_long_ttl() {
    let system = system(|c| c.cache.ttl.ok = 300);
    let ttl = system.calculate_ttl(&response("image/svg+xml"), &TransformOptions::default(), None);
    assert!(ttl >= 1_209_600, "ttl was {ttl}");
}

#[test]
fn test_static_path_gets_thirty_days() {
    let system = system(|c| c.cache.ttl.ok = 300);
    let storage = StorageResult::new("/static/logo.png", SourceType::R2);
    let ttl = system.calculate_ttl(
        &response("image/png"),
        &TransformOptions::default(),
        Some(&storage),
    );
    assert!(ttl >= 2_592_000, "ttl was {ttl}");
}

#[test]
fn test_camera_tags() {
    let system = system(|c| {
        c.cache.cache_tags.prefix = "img-".into();
        c.cache.cache_tags.simplified_tags = false;
    });
    let req = request("/products/electronics/camera.jpg", &[]);
    let storage = StorageResult::new("/products/electronics/camera.jpg", SourceType::R2)
        .with_content_type("image/jpeg");
    let options = TransformOptions::default();
    let tags = system.generate_cache_tags(&req, &storage, &options).unwrap();

    for expected in [
        "img-path-products-electronics-camera-jpg",
        "img-segment-0-products",
        "img-segment-2-camera-jpg",
        "img-dir-products-electronics",
        "img-file-camera-jpg",
    ] {
        assert!(tags.iter().any(|t| t == expected), "missing {expected} in {tags:?}");
    }

    let again = system.generate_cache_tags(&req, &storage, &options).unwrap();
    assert_eq!(tags, again);
}

#[test]
fn test_tag_truncation_keeps_prefix_of_sequence() {
    let storage = StorageResult::new("/products/electronics/camera.jpg", SourceType::R2)
        .with_content_type("image/jpeg");
    let req = request("/products/electronics/camera.jpg", &[]);
    let options = TransformOptions {
        width: Some(640),
        format: Some("webp".into()),
        ..Default::default()
    };

    let full = system(|c| c.cache.cache_tags.max_tags = 100)
        .generate_cache_tags(&req, &storage, &options)
        .unwrap();
    assert!(full.len() > 4);
    let truncated = system(|c| c.cache.cache_tags.max_tags = 4)
        .generate_cache_tags(&req, &storage, &options)
        .unwrap();
    assert_eq!(truncated, full[..4].to_vec());
}

#[test]
fn test_edge_and_transform_bypass_diverge_on_no_cache() {
    let system = system(|_| {});
    let req = request("/img/a.jpg", &[("cache-control", "no-cache")]);
    assert!(system.should_bypass_cache(&req, None).unwrap());
    assert!(!system.should_bypass_kv_transform_cache(&req, None).unwrap());
}

#[test]
fn test_disabled_cacheability_leaves_response_untouched() {
    let system = system(|c| c.cache.cacheability = false);
    let original = response("image/jpeg");
    let out = system.apply_cache_headers(&request("/img/a.jpg", &[]), original.clone(), None, None);
    assert_eq!(out.status(), original.status());
    assert_eq!(out.headers(), original.headers());
    assert_eq!(out.body(), original.body());
}

#[tokio::test]
async fn test_missing_edge_store_still_stamps_headers() {
    let system = system(|c| c.cache.method = CacheMethod::CacheApi);
    let out = system
        .cache_with_fallback(&request("/img/a.jpg", &[]), response("image/jpeg"), None, None, None)
        .await;
    assert!(out.headers().get(CACHE_CONTROL).is_some());
}

#[tokio::test]
async fn test_background_caching_completes_after_drain() {
    let mut config = AppConfig::default();
    config.cache.method = CacheMethod::CacheApi;
    config.cache.enable_background_caching = true;
    let edge = Arc::new(MemoryEdgeCache::new());
    let system = CacheSystem::builder(Arc::new(config))
        .edge_store(edge.clone())
        .build()
        .unwrap();

    let tasks = TrackedTasks::new();
    let ctx = ExecutionContext::new().with_tasks(Arc::new(tasks.clone()));
    let storage = StorageResult::new("/img/a.jpg", SourceType::R2);
    let out = system
        .cache_with_fallback(
            &request("/img/a.jpg", &[]),
            response("image/jpeg"),
            Some(&ctx),
            None,
            Some(&storage),
        )
        .await;
    tasks.drain().await;

    let stored = edge
        .lookup("http://cdn.example.com/img/a.jpg")
        .await
        .unwrap()
        .expect("entry stored in background");
    assert_eq!(stored.headers().get(CACHE_CONTROL), out.headers().get(CACHE_CONTROL));
    assert!(stored.headers().get(CACHE_TAG_HEADER).is_some());

    let tag = "img-path-img-a-jpg";
    assert_eq!(edge.purge_tag(tag), 1);
    assert!(edge.is_empty());
}

#[tokio::test]
async fn test_stale_entry_served_within_window() {
    let mut config = AppConfig::default();
    config.cache.method = CacheMethod::CacheApi;
    config.cache.enable_stale_while_revalidate = true;
    let edge = Arc::new(MemoryEdgeCache::new());
    let system = CacheSystem::builder(Arc::new(config))
        .edge_store(edge.clone())
        .build()
        .unwrap();

    let stale = http::Response::builder()
        .status(200)
        .header("cache-control", "public, max-age=60, stale-while-revalidate=300")
        .header(
            "date",
            httpdate::fmt_http_date(SystemTime::now() - Duration::from_secs(90)),
        )
        .body(Bytes::from_static(b"stale-bytes"))
        .unwrap();
    edge.put("http://cdn.example.com/img/a.jpg", stale).await.unwrap();

    let out = system
        .cache_with_fallback(&request("/img/a.jpg", &[]), response("image/jpeg"), None, None, None)
        .await;
    assert_eq!(out.body(), &Bytes::from_static(b"stale-bytes"));
    assert_eq!(out.headers().get("x-cache-status").unwrap(), "stale");
    assert!(out.headers().get("x-stale-age").is_some());
}

#[tokio::test]
async fn test_transform_store_written_despite_client_no_cache() {
    let mut config = AppConfig::default();
    config.cache.transform_cache.enabled = true;
    let transform = Arc::new(MemoryTransformStore::new());
    let system = CacheSystem::builder(Arc::new(config))
        .transform_store(transform.clone())
        .build()
        .unwrap();

    let options = TransformOptions {
        width: Some(320),
        format: Some("avif".into()),
        ..Default::default()
    };
    let storage = StorageResult::new("/img/a.jpg", SourceType::Remote);
    let req = request("/img/a.jpg?width=320", &[("cache-control", "no-store")]);
    system
        .cache_with_fallback(&req, response("image/avif"), None, Some(&options), Some(&storage))
        .await;
    assert_eq!(transform.len(), 1);

    let hit = system
        .lookup_transformed(&request("/img/a.jpg?width=320", &[]), "/img/a.jpg", &options)
        .await
        .expect("transform entry readable");
    assert_eq!(hit.body(), &Bytes::from_static(b"image-bytes"));
    assert!(system.invalidate_transformed("/img/a.jpg", &options).await.unwrap());
    assert!(transform.is_empty());
}

#[tokio::test]
async fn test_response_tags_come_from_real_request() {
    let req = request("/img/a.jpg?cache-tags=promo", &[]);
    let storage = StorageResult::new("/img/a.jpg", SourceType::R2).with_content_type("image/jpeg");
    let options = TransformOptions::default();

    let system = system(|c| c.cache.method = CacheMethod::Disabled);
    let out = system
        .cache_with_fallback(&req, response("image/jpeg"), None, Some(&options), Some(&storage))
        .await;
    let header_tags: Vec<String> = out
        .headers()
        .get(CACHE_TAG_HEADER)
        .expect("tag header outside cf")
        .to_str()
        .unwrap()
        .split(',')
        .map(String::from)
        .collect();
    assert_eq!(header_tags, system.generate_cache_tags(&req, &storage, &options).unwrap());
    assert!(header_tags.contains(&"img-host-cdn-example-com".to_string()));
    assert!(header_tags.contains(&"img-promo".to_string()));
}

#[tokio::test]
async fn test_cf_method_attaches_tags_only_to_fetch() {
    let system = system(|_| {});
    let req = request("/img/a.jpg?cache-tags=promo", &[]);
    let storage = StorageResult::new("/img/a.jpg", SourceType::R2).with_content_type("image/jpeg");
    let options = TransformOptions::default();

    let out = system
        .cache_with_fallback(&req, response("image/jpeg"), None, Some(&options), Some(&storage))
        .await;
    assert!(out.headers().get(CACHE_TAG_HEADER).is_none());

    let init = system.apply_cloudflare_cache(Default::default(), "/img/a.jpg", &options);
    let cf = init.cf.expect("cf method attaches directives");
    assert!(cf.cache_tags.contains(&"img-path-img-a-jpg".to_string()));
    assert!(!cf.cache_tags.iter().any(|t| t == "img-host-localhost"));
}

#[test]
fn test_edge_directives_for_fetch() {
    let system = system(|c| c.cache.use_ttl_by_status = true);
    let init = system.apply_cloudflare_cache(
        Default::default(),
        "/img/a.jpg",
        &TransformOptions::default(),
    );
    let cf = init.cf.expect("cf method attaches directives");
    assert!(cf.cache_ttl.is_none());
    assert!(cf.cache_ttl_by_status.contains_key("200-299"));
    assert!(!cf.cache_tags.is_empty());
}
