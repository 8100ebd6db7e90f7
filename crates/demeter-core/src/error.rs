use std::time::Duration;

use thiserror::Error;

use crate::records::EntityType;

/// Application-wide error types for demeter.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request completed with a non-success status.
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// Network/connection error before a response was received.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Circuit breaker rejected the request without a network call.
    #[error("Circuit '{key}' is open. Retry after {} seconds.", retry_after.as_secs())]
    CircuitOpen { key: String, retry_after: Duration },

    /// Rate limiter rejected the request.
    #[error("Rate limit reached for '{key}'. Retry after {} seconds.", retry_after.as_secs())]
    RateLimited { key: String, retry_after: Duration },

    /// Headless render collaborator failed.
    #[error("Render error: {0}")]
    RenderError(String),

    /// Selector miss, malformed identifier, or otherwise unusable markup.
    #[error("Extraction error ({entity}) at {url}: {message}")]
    ExtractionError {
        entity: EntityType,
        url: String,
        message: String,
    },

    /// Entity-specific rule failure on an otherwise extracted record.
    #[error("Validation error ({entity}) on field '{field}': {message}")]
    ValidationError {
        entity: EntityType,
        field: String,
        message: String,
    },

    /// Shared keyed store unreachable or misbehaving.
    #[error("Store error: {0}")]
    StoreError(String),

    /// Persistence sink failed to accept a record.
    #[error("Sink error: {0}")]
    SinkError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying
    /// at the scheduler level.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            AppError::RenderError(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error should trip the circuit breaker.
    ///
    /// Self-imposed rejections (rate limit, open circuit) and local
    /// extraction problems never count against the target host.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(
            AppError::HttpStatus {
                status: 503,
                url: "https://example.com".into()
            }
            .is_retryable()
        );
        assert!(
            !AppError::HttpStatus {
                status: 404,
                url: "https://example.com".into()
            }
            .is_retryable()
        );
        assert!(
            !AppError::ValidationError {
                entity: EntityType::Standard,
                field: "code".into(),
                message: "bad".into(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_circuit_tripping() {
        assert!(AppError::Timeout(30).should_trip_circuit());
        assert!(
            AppError::HttpStatus {
                status: 500,
                url: "https://example.com".into()
            }
            .should_trip_circuit()
        );
        // 4xx (other than 429) means the target answered; not a host failure.
        assert!(
            !AppError::HttpStatus {
                status: 404,
                url: "https://example.com".into()
            }
            .should_trip_circuit()
        );
        // Self-imposed rejections must not feed back into the breaker.
        assert!(
            !AppError::RateLimited {
                key: "example.com".into(),
                retry_after: Duration::from_secs(1),
            }
            .should_trip_circuit()
        );
    }
}
