//! Error types for reference dataset loading and refresh.

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::DomainError;
use crate::tracker::FilterError;

/// Errors from loading or refreshing a reference dataset.
///
/// A failed refresh never replaces the live dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Network-level failure while downloading.
    #[error("network error downloading {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[error("HTTP {status} downloading {url}\n  Suggestion: check the dataset URL in the config file")]
    HttpStatus { url: String, status: u16 },

    /// Downloaded bytes do not match the configured SHA-256.
    #[error("content hash mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    /// Reading or writing a dataset file failed.
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A dataset is not present on disk.
    #[error("reference dataset {path} is missing\n  Suggestion: run `privacy-scanner update-datasets`")]
    Missing { path: PathBuf },

    /// A JSON dataset could not be parsed.
    #[error("invalid JSON in {what}: {source}")]
    Json {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    /// The tracker-radar archive could not be unpacked or held too few records.
    #[error("failed to extract {url}: {reason}\n  Suggestion: re-run `privacy-scanner update-datasets --force`")]
    Archive { url: String, reason: String },

    #[error(transparent)]
    PublicSuffix(#[from] DomainError),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

impl DatasetError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Like [`Self::io`], but a missing file becomes [`Self::Missing`].
    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::Missing { path }
        } else {
            Self::Io { path, source }
        }
    }
}
