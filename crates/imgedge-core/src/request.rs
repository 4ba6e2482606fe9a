//! Helpers for reading the parts of an image request the cache layer needs.

use http::HeaderMap;
use url::Url;

use crate::error::{CacheError, Result};
use crate::ImageRequest;

/// Resolve the full URL of a request.
///
/// Origin-form URIs (`/img/a.jpg?w=10`) are resolved against the `Host`
/// header, defaulting to `localhost`.
pub fn request_url(request: &ImageRequest) -> Result<Url> {
    let uri = request.uri();
    let raw = if uri.scheme().is_some() {
        uri.to_string()
    } else {
        let host = header_str(request.headers(), http::header::HOST).unwrap_or("localhost");
        let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        format!("http://{host}{path_and_query}")
    };
    Url::parse(&raw).map_err(|e| CacheError::invalid_request_url(raw.clone(), e.to_string()))
}

/// Read a header as UTF-8, ignoring values that are not.
pub fn header_str<K>(headers: &HeaderMap, name: K) -> Option<&str>
where
    K: http::header::AsHeaderName,
{
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Look up the first value of a query parameter.
pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}
