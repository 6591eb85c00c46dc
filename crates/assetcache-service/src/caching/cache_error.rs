use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::sources::SourceError;

/// An error that happens while resolving, fetching or persisting a cached asset.
///
/// Causes are kept behind an [`Arc`] so the error can be cloned and handed out to every caller
/// that was waiting on the same computation.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The source can not be turned into a cache key.
    ///
    /// This happens for sources that are neither a full URL nor carry an explicit request id.
    #[error("invalid source: {0}")]
    InvalidSource(String),
    /// One of the parts fed into the cache key hash was empty.
    #[error("key part at index {0} is empty")]
    InvalidKeyPart(usize),
    /// A custom filename formatter produced nothing usable after sanitization.
    #[error("invalid cache filename: {0:?}")]
    InvalidFilename(String),
    /// A duration string did not follow the `<integer><unit>` or `*` grammar.
    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),
    /// An attempt to save contents that amount to nothing.
    #[error("refusing to cache empty contents for {0}")]
    EmptyContents(String),
    /// The source itself failed.
    ///
    /// Only this error is eligible for falling back to an expired cache entry.
    #[error("failed to fetch {display}")]
    SourceFailure {
        display: String,
        #[source]
        cause: SourceError,
    },
    /// Creating a directory, or reading or writing a cache file failed.
    #[error("filesystem error")]
    Filesystem(#[source] Arc<io::Error>),
    /// A cache file or a fetched body could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
}

impl CacheError {
    /// Whether this error came from the source rather than from the cache itself.
    pub fn is_source_failure(&self) -> bool {
        matches!(self, Self::SourceFailure { .. })
    }

    /// The underlying [`io::ErrorKind`] for filesystem failures.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Filesystem(err) => Some(err.kind()),
            _ => None,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        Self::Filesystem(Arc::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
