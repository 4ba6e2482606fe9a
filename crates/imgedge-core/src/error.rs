use thiserror::Error;

/// Error taxonomy for the caching subsystem.
///
/// Only `InvalidRequestUrl` is ever surfaced to a client (as a 400); every
/// other kind is contained by the orchestrator, which falls back to serving
/// an uncached response.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Invalid request URL '{url}': {reason}")]
    InvalidRequestUrl { url: String, reason: String },

    #[error("TTL calculator initialization failed: {0}")]
    TtlCalculatorInit(String),

    #[error("Cache tag generation failed: {0}")]
    TagGeneration(String),

    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache write failed during {operation}: {message}")]
    Write { operation: String, message: String },

    #[error("Cache quota exceeded during {operation}: {message}")]
    QuotaExceeded { operation: String, message: String },

    #[error("Circuit open for {operation}, retry after cool-down")]
    CircuitOpen { operation: String },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    pub fn invalid_request_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequestUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn ttl_calculator_init(message: impl Into<String>) -> Self {
        Self::TtlCalculatorInit(message.into())
    }

    pub fn tag_generation(message: impl Into<String>) -> Self {
        Self::TagGeneration(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn write(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Write {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn quota_exceeded(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn circuit_open(operation: impl Into<String>) -> Self {
        Self::CircuitOpen {
            operation: operation.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Stable machine-readable code, used in logs and upstream error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequestUrl { .. } => "INVALID_REQUEST_URL",
            Self::TtlCalculatorInit(_) => "TTL_CALCULATOR_INIT_ERROR",
            Self::TagGeneration(_) => "CACHE_TAG_GENERATION_ERROR",
            Self::Unavailable(_) => "CACHE_UNAVAILABLE",
            Self::Write { .. } => "CACHE_WRITE_ERROR",
            Self::QuotaExceeded { .. } => "CACHE_QUOTA_EXCEEDED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// Whether the resilience envelope may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Write { .. })
    }

    /// Quota exhaustion asks the caller to cache less aggressively.
    pub fn reduce_caching(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    /// HTTP status an upstream handler should map this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequestUrl { .. } => 400,
            _ => 500,
        }
    }
}

/// Convenience result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
