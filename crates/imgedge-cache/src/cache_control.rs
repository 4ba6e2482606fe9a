//! Minimal `Cache-Control` directive parsing.

use http::HeaderMap;
use http::header::CACHE_CONTROL;

/// Parsed `Cache-Control` directives, names lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    directives: Vec<(String, Option<String>)>,
}

impl CacheControl {
    pub fn parse(value: &str) -> Self {
        let directives = value
            .split(',')
            .filter_map(|part| {
                let part = part.trim();
                if part.is_empty() {
                    return None;
                }
                match part.split_once('=') {
                    Some((name, arg)) => Some((
                        name.trim().to_ascii_lowercase(),
                        Some(arg.trim().trim_matches('"').to_string()),
                    )),
                    None => Some((part.to_ascii_lowercase(), None)),
                }
            })
            .collect();
        Self { directives }
    }

    /// Combine every `Cache-Control` header on a message.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let joined: Vec<&str> = headers
            .get_all(CACHE_CONTROL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if joined.is_empty() {
            None
        } else {
            Some(Self::parse(&joined.join(",")))
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.directives.iter().any(|(n, _)| n == name)
    }

    /// Numeric argument of a directive; malformed values read as absent.
    pub fn seconds(&self, name: &str) -> Option<u64> {
        self.directives
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
            .and_then(|v| v.parse::<u64>().ok())
    }

    pub fn max_age(&self) -> Option<u64> {
        self.seconds("max-age")
    }

    pub fn stale_while_revalidate(&self) -> Option<u64> {
        self.seconds("stale-while-revalidate")
    }

    /// `no-cache`, `no-store` or `max-age=0`.
    pub fn forbids_cached_response(&self) -> bool {
        self.has("no-cache") || self.has("no-store") || self.max_age() == Some(0)
    }
}
