use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Coarse failure classes shared by every subsystem. They decide whether a
/// failure is retried, isolated or left for a later queue pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Network or subprocess hiccup; retried with backoff up to a bound.
    TransientIo,
    /// Memory or time budget breached; never retried automatically.
    ResourceExceeded,
    /// Reference to state that does not exist; logged and discarded.
    DataInconsistency,
    /// Platform metadata unobtainable after bounded retries.
    UpstreamUnavailable,
    /// Encoder exit or missing artifact; original capture preserved.
    CompositionFailure,
    /// Bootstrap or storage failure outside the taxonomy above.
    Internal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::TransientIo => "transient_io",
            FailureClass::ResourceExceeded => "resource_exceeded",
            FailureClass::DataInconsistency => "data_inconsistency",
            FailureClass::UpstreamUnavailable => "upstream_unavailable",
            FailureClass::CompositionFailure => "composition_failure",
            FailureClass::Internal => "internal",
        }
    }

    /// Whether a failed job of this class may be requeued without an
    /// operator.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FailureClass::ResourceExceeded | FailureClass::DataInconsistency
        )
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub trait Classify {
    fn class(&self) -> FailureClass;
}
