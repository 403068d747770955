//! Error types for cloudcost

use crate::cost::Provider;
use serde::Serialize;
use thiserror::Error;

/// Result type alias using cloudcost's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Cloudcost error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Config errors (E100-E199)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid date range: {0}")]
    InvalidRange(String),

    #[error("Unknown provider '{0}'. Valid providers: aws, gcp, azure.")]
    UnknownProvider(String),

    #[error("No collector registered for provider '{0}'. Check its credentials with `cloudcost test-connections`.")]
    ProviderNotConfigured(Provider),

    // Network errors (E200-E299)
    #[error("Network error: {0}. Check your internet connection.")]
    NetworkError(#[from] reqwest::Error),

    // Storage errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Failed to write cost records: {0}")]
    WriteError(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "E100",
            Self::InvalidRange(_) => "E101",
            Self::UnknownProvider(_) => "E102",
            Self::ProviderNotConfigured(_) => "E103",
            Self::NetworkError(_) => "E200",
            Self::DatabaseError(_) => "E400",
            Self::WriteError(_) => "E401",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::ConfigError(_) => Some("cloudcost config show".to_string()),
            Self::InvalidRange(_) => {
                Some("Dates use YYYY-MM-DD and the end date cannot be in the future".to_string())
            }
            Self::UnknownProvider(_) => Some("--providers aws,gcp,azure".to_string()),
            Self::ProviderNotConfigured(_) => Some("cloudcost test-connections".to_string()),
            Self::NetworkError(_) => Some("Check internet connection".to_string()),
            Self::DatabaseError(_) => Some("cloudcost init-db".to_string()),
            _ => None,
        }
    }

    /// Whether this error belongs to the configuration family (fatal before any I/O)
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::ConfigError(_)
                | Self::InvalidRange(_)
                | Self::UnknownProvider(_)
                | Self::ProviderNotConfigured(_)
        )
    }
}

/// A provider collector failure. Recorded per provider, never propagated past the aggregator.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{provider}: {kind}")]
pub struct CollectorError {
    pub provider: Provider,
    pub kind: CollectorErrorKind,
}

impl CollectorError {
    pub fn new(provider: Provider, kind: CollectorErrorKind) -> Self {
        Self { provider, kind }
    }

    pub fn auth(provider: Provider, msg: impl Into<String>) -> Self {
        Self::new(provider, CollectorErrorKind::Auth(msg.into()))
    }

    pub fn request(provider: Provider, msg: impl Into<String>) -> Self {
        Self::new(provider, CollectorErrorKind::Request(msg.into()))
    }

    pub fn response(provider: Provider, msg: impl Into<String>) -> Self {
        Self::new(provider, CollectorErrorKind::Response(msg.into()))
    }

    pub fn cancelled(provider: Provider) -> Self {
        Self::new(provider, CollectorErrorKind::Cancelled)
    }

    /// Classify a transport error from reqwest
    pub fn from_reqwest(provider: Provider, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            CollectorErrorKind::Request(format!("request timed out: {err}"))
        } else if err.is_decode() {
            CollectorErrorKind::Response(format!("malformed response body: {err}"))
        } else {
            CollectorErrorKind::Request(err.to_string())
        };
        Self::new(provider, kind)
    }

    /// Classify a non-success HTTP status
    pub fn from_status(provider: Provider, status: reqwest::StatusCode, body: &str) -> Self {
        let snippet: String = body.chars().take(300).collect();
        let kind = match status.as_u16() {
            401 | 403 => CollectorErrorKind::Auth(format!("HTTP {status}: {snippet}")),
            429 => CollectorErrorKind::RateLimited(format!("HTTP {status}: {snippet}")),
            _ => CollectorErrorKind::Response(format!("HTTP {status}: {snippet}")),
        };
        Self::new(provider, kind)
    }
}

/// Failure categories a collector can report
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CollectorErrorKind {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected response: {0}")]
    Response(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("collector task panicked: {0}")]
    Panicked(String),
}

impl CollectorErrorKind {
    /// Short stable label, used in summaries and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::RateLimited(_) => "rate_limited",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::SessionExpired(_) => "session_expired",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Panicked(_) => "panicked",
        }
    }
}
