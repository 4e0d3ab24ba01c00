use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for JobSentinel.
#[derive(Error, Debug)]
pub enum AppError {
    /// Network failure or 5xx from a source. Transient.
    #[error("Source '{source_id}' unavailable: {message}")]
    SourceUnavailable { source_id: String, message: String },

    /// Source answered 429. Transient, but the adapter's limiter must cool down.
    #[error("Source '{source_id}' rate limited the request")]
    SourceRateLimited {
        source_id: String,
        retry_after: Option<Duration>,
    },

    /// Source rejected our credentials (401/403).
    #[error("Source '{source_id}' rejected credentials: {message}")]
    SourceAuthError { source_id: String, message: String },

    /// A single provider record did not match the expected shape.
    #[error("Source '{source_id}' returned an unparseable record: {message}")]
    SourceParseError { source_id: String, message: String },

    /// The query handed to an adapter is malformed (empty keywords, page 0, bad URL).
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A token bucket was asked for more tokens than it can ever hold.
    #[error("Invalid rate limit request: {requested} tokens exceeds capacity {capacity}")]
    InvalidRateLimitRequest { requested: u32, capacity: u32 },

    /// The durable dedup state could not be read back.
    #[error("Dedup index corruption: {0}")]
    DedupIndexCorruption(String),

    /// User preferences failed validation.
    #[error("Invalid preferences: {0}")]
    InvalidPreferences(String),

    /// Missing or malformed configuration.
    #[error("Config error: {0}")]
    ConfigError(String),

    /// Non-retryable HTTP failure (unexpected 4xx, bad URL, unreadable body).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Filesystem access failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::SourceUnavailable { .. }
                | AppError::SourceRateLimited { .. }
                | AppError::Timeout(_)
        )
    }

    /// Returns true if this error should count against the circuit breaker.
    ///
    /// Auth and parse errors are not the source being unhealthy, so they
    /// never trip the circuit.
    pub fn should_trip_circuit(&self) -> bool {
        matches!(
            self,
            AppError::SourceUnavailable { .. }
                | AppError::SourceRateLimited { .. }
                | AppError::Timeout(_)
        )
    }

    /// Returns the extra limiter cooldown this error demands, if any.
    ///
    /// Rate-limited responses without a `Retry-After` hint fall back to
    /// `default_cooldown`.
    pub fn forced_cooldown(&self, default_cooldown: Duration) -> Option<Duration> {
        match self {
            AppError::SourceRateLimited { retry_after, .. } => {
                Some(retry_after.unwrap_or(default_cooldown))
            }
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, AppError::SourceAuthError { .. })
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, AppError::SourceParseError { .. })
    }

    pub fn unavailable(source_id: &str, message: impl Into<String>) -> Self {
        AppError::SourceUnavailable {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }

    pub fn parse(source_id: &str, message: impl Into<String>) -> Self {
        AppError::SourceParseError {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }

    pub fn auth(source_id: &str, message: impl Into<String>) -> Self {
        AppError::SourceAuthError {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }
}
