use serde::{Deserialize, Serialize};

/// Resolved transformation parameters for a single request.
///
/// Produced by parameter resolution (native or Akamai-style query strings)
/// before the cache layer sees it; treated as an immutable value here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gravity: Option<String>,
    /// Named template id, e.g. `thumbnail`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivative: Option<String>,
    /// Opt-in feature flags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    /// Request path as seen by parameter resolution (internal)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl TransformOptions {
    /// `format=auto` asks for content negotiation on `Accept`.
    pub fn is_auto_format(&self) -> bool {
        self.format
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("auto"))
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_format() {
        let opts = TransformOptions {
            format: Some("AUTO".into()),
            ..Default::default()
        };
        assert!(opts.is_auto_format());
        assert!(!TransformOptions::default().is_auto_format());
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let opts = TransformOptions {
            width: Some(800),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&opts).unwrap(), r#"{"width":800}"#);
    }
}
