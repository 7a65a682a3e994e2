//! Error types for tekmerion.
//!
//! Taxonomy:
//! - Expected failures: bad input, empty retrieval, unparseable output
//! - Infrastructure failures: network, timeout, rate limits
//! - Invariant violations: internal bugs
//!
//! Exhausted repair rounds are deliberately NOT an error: the orchestrator
//! returns a complete `GenerationResult` with `exhausted = true` instead.
//! The same goes for a choice with no usable evidence; that is a failing
//! verdict on the choice, which the repair loop owns.

use thiserror::Error;

/// Top-level error type for tekmerion.
#[derive(Debug, Error)]
pub enum TekmerionError {
    // ═══════════════════════════════════════════════════════════════════
    // EXPECTED FAILURES — preconditions and domain outcomes
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Multi-query retrieval produced nothing above the similarity floor.
    /// The caller must surface this as a "relax parameters" condition.
    #[error("No similar passages found; relax min_score or broaden the query")]
    RetrievalEmpty,

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE FAILURES — transport and capability availability
    // ═══════════════════════════════════════════════════════════════════
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    /// A capability is not configured or not reachable. Fatal only at
    /// process startup; during a request the caller degrades instead.
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // INVARIANT VIOLATIONS — bugs, should not happen
    // ═══════════════════════════════════════════════════════════════════
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors from the OpenAI-compatible endpoint.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Rate limited by endpoint: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<f64>,
    },

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

impl TekmerionError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is retryable at the transport level.
    ///
    /// Server-side 5xx responses count as transient; auth failures, unknown
    /// models and other 4xx responses do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Network(_) => true,
            Self::Api(ApiError::RateLimited { .. }) => true,
            Self::Api(ApiError::ApiError { status, .. }) => *status >= 500,
            _ => false,
        }
    }

    /// Get retry delay hint in seconds, if applicable.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            Self::Api(ApiError::RateLimited {
                retry_after_secs, ..
            }) => *retry_after_secs,
            _ => None,
        }
    }
}

/// Result type alias for tekmerion.
pub type Result<T> = std::result::Result<T, TekmerionError>;
