//! Error kinds recognised by the analysis core
//!
//! Propagation policy: `configuration` and `input_validation` abort the run
//! before any stage executes; `network_transient` is retried; permanent and
//! not-found outcomes are recorded against the package they concern;
//! `cancelled` unwinds immediately; `internal` becomes a failed stage result
//! and the run continues.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    InputValidation,
    NetworkTransient,
    NetworkPermanent,
    NotFound,
    UpstreamSchema,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn is_network(&self) -> bool {
        matches!(self, ErrorKind::NetworkTransient | ErrorKind::NetworkPermanent)
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("input validation failed: {0}")]
    InputValidation(String),

    #[error("transient network failure: {0}")]
    NetworkTransient(String),

    #[error("permanent network failure: {0}")]
    NetworkPermanent(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream response failed schema validation: {0}")]
    UpstreamSchema(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::Configuration(_) => ErrorKind::Configuration,
            ScanError::InputValidation(_) => ErrorKind::InputValidation,
            ScanError::NetworkTransient(_) => ErrorKind::NetworkTransient,
            ScanError::NetworkPermanent(_) => ErrorKind::NetworkPermanent,
            ScanError::NotFound(_) => ErrorKind::NotFound,
            ScanError::UpstreamSchema(_) => ErrorKind::UpstreamSchema,
            ScanError::Cancelled => ErrorKind::Cancelled,
            ScanError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same operation could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ScanError::NetworkTransient(_))
    }

    /// Classify an HTTP status code. 404 is a legitimate result, 5xx is
    /// retryable, other 4xx are permanent.
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            404 => ScanError::NotFound(context.to_string()),
            429 | 500..=599 => {
                ScanError::NetworkTransient(format!("{context}: HTTP {status}"))
            }
            _ => ScanError::NetworkPermanent(format!("{context}: HTTP {status}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ScanError::from_status(404, "x").kind(), ErrorKind::NotFound);
        assert_eq!(
            ScanError::from_status(500, "x").kind(),
            ErrorKind::NetworkTransient
        );
        assert_eq!(
            ScanError::from_status(429, "x").kind(),
            ErrorKind::NetworkTransient
        );
        assert_eq!(
            ScanError::from_status(403, "x").kind(),
            ErrorKind::NetworkPermanent
        );
    }

    #[test]
    fn test_transient_predicate() {
        assert!(ScanError::NetworkTransient("timeout".into()).is_transient());
        assert!(!ScanError::NetworkPermanent("tls".into()).is_transient());
        assert!(!ScanError::Cancelled.is_transient());
    }
}
