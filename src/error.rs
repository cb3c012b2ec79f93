//! Error types for the IdP gateway

use std::io;

use thiserror::Error;

/// Result type alias for the IdP gateway
pub type Result<T> = std::result::Result<T, Error>;

/// IdP gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No candidate endpoint answered with a usable discovery document
    #[error("IdP discovery failed, attempted: {}", attempted.join(", "))]
    Discovery {
        /// Base URLs tried, in order
        attempted: Vec<String>,
    },

    /// Admin credential could not be obtained
    #[error("Admin authentication failed: {0}")]
    Auth(String),

    /// Caller token is missing, malformed, inactive or expired
    #[error("Token validation failed: {0}")]
    Validation(String),

    /// Caller is not allowed to act on the target
    #[error("Forbidden: {0}")]
    Authorization(String),

    /// IdP answered with a non-success status
    #[error("IdP returned HTTP {status}: {body}")]
    Upstream {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Degraded store could not be read or written
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Target does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request input rejected
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an upstream error from a status and body
    pub fn upstream(status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        Self::Upstream {
            status: status.as_u16(),
            body: body.into(),
        }
    }

    /// HTTP status a request handler should answer with
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 401,
            Self::Authorization(_) => 403,
            Self::NotFound(_) => 404,
            Self::InvalidInput(_) => 400,
            Self::Upstream { status, .. } => *status,
            Self::Discovery { .. } | Self::Auth(_) | Self::Http(_) => 503,
            _ => 500,
        }
    }

    /// Whether this error means the privileged channel is unavailable, so the
    /// degraded path may serve the request instead.
    #[must_use]
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, Self::Discovery { .. } | Self::Auth(_) | Self::Http(_))
    }
}
