use std::time::Duration;

use thiserror::Error;

use crate::error::{Classify, FailureClass};

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("timeout after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("browser memory {used_mb} MiB exceeds limit of {limit_mb} MiB")]
    ResourceExceeded { used_mb: u64, limit_mb: u64 },
    #[error("page script failed: {0}")]
    Script(String),
    #[error("browser already shut down")]
    Closed,
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl Classify for BrowserError {
    fn class(&self) -> FailureClass {
        match self {
            BrowserError::ResourceExceeded { .. } | BrowserError::Timeout { .. } => {
                FailureClass::ResourceExceeded
            }
            BrowserError::Launch(_) | BrowserError::Configuration(_) => FailureClass::Internal,
            _ => FailureClass::CompositionFailure,
        }
    }
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}
