//! Source image retrieval results.
//!
//! A `StorageResult` is produced once per request by the storage layer and is
//! read-only for every cache component.

use serde::{Deserialize, Serialize};

use crate::ImageResponse;

/// Where a source image was fetched from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Primary object store bucket
    #[default]
    R2,
    /// Remote HTTP origin
    Remote,
    /// Fallback HTTP origin
    Fallback,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::R2 => "r2",
            SourceType::Remote => "remote",
            SourceType::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of retrieving a source image.
#[derive(Debug, Clone)]
pub struct StorageResult {
    pub response: ImageResponse,
    pub source_type: SourceType,
    pub content_type: Option<String>,
    /// Size in bytes
    pub size: Option<u64>,
    /// Normalized logical path, always starting with `/`
    pub path: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub original_url: Option<String>,
    /// Content digest reported by the origin (ETag or object hash)
    pub content_hash: Option<String>,
}

impl StorageResult {
    /// Create a result for `path` with an empty 200 response.
    pub fn new(path: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            response: ImageResponse::default(),
            source_type,
            content_type: None,
            size: None,
            path: path.into(),
            width: None,
            height: None,
            original_url: None,
            content_hash: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_response(mut self, response: ImageResponse) -> Self {
        self.response = response;
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Pixel count when both dimensions are known.
    pub fn pixel_count(&self) -> Option<u64> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(u64::from(w) * u64::from(h)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_serde() {
        let json = serde_json::to_string(&SourceType::Remote).unwrap();
        assert_eq!(json, "\"remote\"");
        let parsed: SourceType = serde_json::from_str("\"r2\"").unwrap();
        assert_eq!(parsed, SourceType::R2);
    }

    #[test]
    fn test_pixel_count() {
        let result = StorageResult::new("/img/a.jpg", SourceType::R2).with_dimensions(100, 50);
        assert_eq!(result.pixel_count(), Some(5000));
        assert_eq!(StorageResult::new("/x", SourceType::R2).pixel_count(), None);
    }
}
