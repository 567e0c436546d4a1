//! Custom error types for forgeflow

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for forgeflow operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transient platform error: {0}")]
    Transient(String),

    #[error("Rate limited (remaining {remaining:?}, resets {reset_at:?})")]
    RateLimited {
        remaining: Option<u64>,
        reset_at: Option<DateTime<Utc>>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Capability not supported by forge: {0}")]
    Unsupported(String),

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl Error {
    /// Whether the retry policy should attempt this operation again.
    ///
    /// Not-found and validation failures are permanent; network faults,
    /// 5xx responses and throttling are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transient(_) | Error::RateLimited { .. } => true,
            Error::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    return true;
                }
                match e.status() {
                    Some(status) => status.is_server_error(),
                    None => true,
                }
            }
            _ => false,
        }
    }

    /// For rate-limit errors, how long to wait before the quota resets.
    /// Returns `None` when the platform did not report a reset time.
    pub fn retry_after(&self) -> Option<chrono::Duration> {
        match self {
            Error::RateLimited {
                reset_at: Some(reset),
                ..
            } => {
                let wait = *reset - Utc::now();
                (wait > chrono::Duration::zero()).then_some(wait)
            }
            _ => None,
        }
    }
}

/// Result type alias for forgeflow
pub type Result<T> = std::result::Result<T, Error>;
