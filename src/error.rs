use std::path::PathBuf;
use thiserror::Error;

/// Why a measurement attempt produced no speed.
///
/// The `Display` output is the bare failure description; it is what ends up
/// in the `ERROR` column of the results log.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    /// No endpoint could be selected to measure against.
    #[error("{0}")]
    NoServer(String),

    #[error("{0}")]
    Timeout(String),

    /// Connection refused, reset, or the host name did not resolve.
    #[error("{0}")]
    Unreachable(String),

    #[error("{0}")]
    Other(String),
}

impl ProbeError {
    pub fn is_network(&self) -> bool {
        matches!(self, ProbeError::Timeout(_) | ProbeError::Unreachable(_))
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed row {line} in {path:?}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
