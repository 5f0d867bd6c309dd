//! Error types for the ingestion pipeline
//!
//! Fetch errors halt the block fetcher and are kept for later inspection;
//! store errors are reported through the persistence backlog.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("failed to parse endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message:?}")]
    Rpc { code: i64, message: String },

    #[error("unexpected response {0:?}")]
    UnexpectedResponse(String),

    #[error("failed to decode response body {body:?}: {reason}")]
    Decode { reason: String, body: String },

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("block fetcher already started")]
    AlreadyStarted,

    #[error("block consumer went away")]
    QueueClosed,

    #[error("failed to {action}: {source}")]
    Context {
        action: String,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Wrap this error with a description of what was being attempted.
    pub fn context(self, action: impl Into<String>) -> Self {
        Self::Context {
            action: action.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with any context layers removed.
    pub fn root(&self) -> &FetchError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Failure reported by a transaction store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// Persistence errors drained from the backlog in one go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreErrors(pub Vec<StoreError>);

impl fmt::Display for StoreErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for StoreErrors {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_chain() {
        let err = FetchError::Rpc {
            code: -32000,
            message: "x".to_string(),
        }
        .context("get current block number");

        assert_eq!(
            err.to_string(),
            "failed to get current block number: rpc error -32000: \"x\""
        );
        assert!(matches!(err.root(), FetchError::Rpc { code: -32000, .. }));
    }

    #[test]
    fn test_store_errors_join() {
        let errs = StoreErrors(vec![
            StoreError("disk full".to_string()),
            StoreError("disk still full".to_string()),
        ]);
        assert_eq!(
            errs.to_string(),
            "store error: disk full\nstore error: disk still full"
        );
    }
}
