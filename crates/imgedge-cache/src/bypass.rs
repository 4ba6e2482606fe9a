//! Cache bypass decisions.
//!
//! Two scopes share one rule list. The edge scope honours every rule. The
//! transform-store scope never applies the preview, admin and development
//! rules, applies the client `Cache-Control`/`Pragma` rules only when
//! `transform_cache.respect_client_cache_control` is set, and additionally
//! honours `transform_cache.disallowed_paths`.

use std::sync::Arc;

use http::header::PRAGMA;
use imgedge_config::AppConfig;
use imgedge_core::{CacheError, ImageRequest, TransformOptions, header_str, query_param, request_url};
use tracing::debug;

use crate::cache_control::CacheControl;

const DEBUG_BYPASS_VALUES: &[&str] = &["cache", "true", "1", "all"];

/// Which cache a bypass decision is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassScope {
    Edge,
    TransformStore,
}

/// Why a request bypasses a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassReason {
    DebugParam(String),
    RefreshParam,
    PreviewParam,
    ConfiguredParam(String),
    ClientCacheControl,
    Pragma,
    Admin,
    Path(String),
    Format(String),
    Development,
}

impl std::fmt::Display for BypassReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BypassReason::DebugParam(v) => write!(f, "debug={v}"),
            BypassReason::RefreshParam => write!(f, "refresh parameter"),
            BypassReason::PreviewParam => write!(f, "preview parameter"),
            BypassReason::ConfiguredParam(p) => write!(f, "bypass parameter '{p}'"),
            BypassReason::ClientCacheControl => write!(f, "client cache-control"),
            BypassReason::Pragma => write!(f, "pragma no-cache"),
            BypassReason::Admin => write!(f, "admin request"),
            BypassReason::Path(p) => write!(f, "bypass path '{p}'"),
            BypassReason::Format(fmt) => write!(f, "bypass format '{fmt}'"),
            BypassReason::Development => write!(f, "development environment"),
        }
    }
}

/// Decides whether a request skips the edge cache or the transform store.
pub struct CacheBypassManager {
    config: Arc<AppConfig>,
}

impl CacheBypassManager {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    /// Whether the edge cache must be skipped. Errors only on an unparsable URL.
    pub fn should_bypass_cache(
        &self,
        request: &ImageRequest,
        options: Option<&TransformOptions>,
    ) -> Result<bool, CacheError> {
        Ok(self.bypass_reason(request, options, BypassScope::Edge)?.is_some())
    }

    /// Whether the transform store must be skipped.
    pub fn should_bypass_kv_transform_cache(
        &self,
        request: &ImageRequest,
        options: Option<&TransformOptions>,
    ) -> Result<bool, CacheError> {
        Ok(self
            .bypass_reason(request, options, BypassScope::TransformStore)?
            .is_some())
    }

    /// First matching bypass rule for `scope`, if any.
    pub fn bypass_reason(
        &self,
        request: &ImageRequest,
        options: Option<&TransformOptions>,
        scope: BypassScope,
    ) -> Result<Option<BypassReason>, CacheError> {
        let reason = self.evaluate(request, options, scope)?;
        if let Some(reason) = &reason {
            debug!(scope = ?scope, reason = %reason, path = request.uri().path(), "cache bypassed");
        }
        Ok(reason)
    }

    fn evaluate(
        &self,
        request: &ImageRequest,
        options: Option<&TransformOptions>,
        scope: BypassScope,
    ) -> Result<Option<BypassReason>, CacheError> {
        let config = &self.config;
        let cache = &config.cache;
        let url = request_url(request)?;
        let edge = scope == BypassScope::Edge;
        let client_rules = edge || cache.transform_cache.respect_client_cache_control;

        if cache.version_bypass {
            if let Some(version) = query_param(&url, "v") {
                debug!(version = %version, "version parameter present, not bypassing");
            }
        }

        // 1
        if let Some(value) = query_param(&url, "debug") {
            if DEBUG_BYPASS_VALUES.contains(&value.as_str()) {
                return Ok(Some(BypassReason::DebugParam(value)));
            }
        }
        // 2
        if query_param(&url, "refresh").is_some() || query_param(&url, "force-refresh").is_some() {
            return Ok(Some(BypassReason::RefreshParam));
        }
        // 3
        if edge && (query_param(&url, "preview").is_some() || query_param(&url, "dev").is_some()) {
            return Ok(Some(BypassReason::PreviewParam));
        }
        // 4
        if let Some(param) = cache
            .bypass_params
            .iter()
            .find(|p| query_param(&url, p).is_some())
        {
            return Ok(Some(BypassReason::ConfiguredParam(param.clone())));
        }
        // 5
        if client_rules
            && CacheControl::from_headers(request.headers())
                .is_some_and(|cc| cc.forbids_cached_response())
        {
            return Ok(Some(BypassReason::ClientCacheControl));
        }
        // 6
        if client_rules && pragma_no_cache(request) {
            return Ok(Some(BypassReason::Pragma));
        }
        // 7
        if edge
            && cache.bypass_for_admin
            && request.headers().contains_key(cache.admin_role_header.as_str())
        {
            return Ok(Some(BypassReason::Admin));
        }
        // 8
        let path = url.path();
        let disallowed = if edge {
            &[][..]
        } else {
            cache.transform_cache.disallowed_paths.as_slice()
        };
        if let Some(p) = cache
            .bypass_paths
            .iter()
            .chain(disallowed)
            .find(|p| path.contains(p.as_str()))
        {
            return Ok(Some(BypassReason::Path(p.clone())));
        }
        // 9
        if let Some(format) = options.and_then(|o| o.format.as_deref()) {
            if cache.bypass_formats.iter().any(|f| f == format) {
                return Ok(Some(BypassReason::Format(format.to_string())));
            }
        }
        // 10
        if edge && config.environment.is_development() && cache.bypass_in_development {
            return Ok(Some(BypassReason::Development));
        }

        Ok(None)
    }
}

fn pragma_no_cache(request: &ImageRequest) -> bool {
    header_str(request.headers(), PRAGMA).is_some_and(|p| p.to_ascii_lowercase().contains("no-cache"))
}

/// Whether the request carries a client `Cache-Control` that asks for a fresh copy.
pub(crate) fn client_requests_fresh(request: &ImageRequest) -> bool {
    let cache_control = CacheControl::from_headers(request.headers())
        .is_some_and(|cc| cc.forbids_cached_response());
    cache_control || pragma_no_cache(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgedge_config::Environment;

    fn manager_with(f: impl FnOnce(&mut AppConfig)) -> CacheBypassManager {
        let mut config = AppConfig::default();
        f(&mut config);
        CacheBypassManager::new(Arc::new(config))
    }

    fn request(uri: &str, headers: &[(&str, &str)]) -> ImageRequest {
        let mut builder = http::Request::builder().uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap()
    }

    fn both(manager: &CacheBypassManager, req: &ImageRequest) -> (bool, bool) {
        (
            manager.should_bypass_cache(req, None).unwrap(),
            manager.should_bypass_kv_transform_cache(req, None).unwrap(),
        )
    }

    #[test]
    fn test_plain_request_not_bypassed() {
        let manager = manager_with(|_| {});
        assert_eq!(both(&manager, &request("/img/a.jpg?width=800", &[])), (false, false));
    }

    #[test]
    fn test_query_triggers() {
        let manager = manager_with(|_| {});
        assert_eq!(both(&manager, &request("/a.jpg?debug=cache", &[])), (true, true));
        assert_eq!(both(&manager, &request("/a.jpg?debug=headers", &[])), (false, false));
        assert_eq!(both(&manager, &request("/a.jpg?force-refresh", &[])), (true, true));
        assert_eq!(both(&manager, &request("/a.jpg?preview=1", &[])), (true, false));
        assert_eq!(both(&manager, &request("/a.jpg?nocache", &[])), (true, true));
    }

    #[test]
    fn test_version_param_does_not_bypass() {
        let manager = manager_with(|_| {});
        assert_eq!(both(&manager, &request("/a.jpg?v=3", &[])), (false, false));
    }

    #[test]
    fn test_client_cache_control_diverges() {
        let manager = manager_with(|_| {});
        let req = request("/a.jpg", &[("cache-control", "no-cache")]);
        assert_eq!(both(&manager, &req), (true, false));
        let req = request("/a.jpg", &[("pragma", "no-cache")]);
        assert_eq!(both(&manager, &req), (true, false));
        assert_eq!(
            manager
                .bypass_reason(&request("/a.jpg", &[("cache-control", "max-age=0")]), None, BypassScope::Edge)
                .unwrap(),
            Some(BypassReason::ClientCacheControl)
        );

        let respecting = manager_with(|c| c.cache.transform_cache.respect_client_cache_control = true);
        let req = request("/a.jpg", &[("cache-control", "no-store")]);
        assert_eq!(both(&respecting, &req), (true, true));
    }

    #[test]
    fn test_admin_paths_formats_and_environment() {
        let manager = manager_with(|c| {
            c.cache.bypass_for_admin = true;
            c.cache.bypass_paths = vec!["/private/".into()];
            c.cache.bypass_formats = vec!["gif".into()];
            c.cache.transform_cache.disallowed_paths = vec!["/drafts/".into()];
        });
        let admin = request("/a.jpg", &[("x-admin-role", "editor")]);
        assert_eq!(both(&manager, &admin), (true, false));
        assert_eq!(both(&manager, &request("/private/a.jpg", &[])), (true, true));
        assert_eq!(both(&manager, &request("/drafts/a.jpg", &[])), (false, true));

        let gif = TransformOptions {
            format: Some("gif".into()),
            ..Default::default()
        };
        let req = request("/a.jpg", &[]);
        assert!(manager.should_bypass_cache(&req, Some(&gif)).unwrap());
        assert!(manager.should_bypass_kv_transform_cache(&req, Some(&gif)).unwrap());

        let dev = manager_with(|c| c.environment = Environment::Development);
        assert_eq!(both(&dev, &request("/a.jpg", &[])), (true, false));
        let dev_cached = manager_with(|c| {
            c.environment = Environment::Development;
            c.cache.bypass_in_development = false;
        });
        assert_eq!(both(&dev_cached, &request("/a.jpg", &[])), (false, false));
    }

    #[test]
    fn test_first_rule_wins() {
        let manager = manager_with(|_| {});
        let req = request("/a.jpg?debug=1&nocache", &[("cache-control", "no-cache")]);
        assert_eq!(
            manager.bypass_reason(&req, None, BypassScope::Edge).unwrap(),
            Some(BypassReason::DebugParam("1".into()))
        );
    }

    #[test]
    fn test_unparsable_url_errors() {
        let manager = manager_with(|_| {});
        let req = request("/a.jpg", &[("host", "bad host:xx")]);
        let err = manager.should_bypass_cache(&req, None).unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST_URL");
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_client_requests_fresh() {
        assert!(client_requests_fresh(&request("/a", &[("cache-control", "no-store")])));
        assert!(client_requests_fresh(&request("/a", &[("pragma", "no-cache")])));
        assert!(!client_requests_fresh(&request("/a", &[("cache-control", "max-age=60")])));
    }
}
