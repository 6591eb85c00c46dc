//! The things an asset can be fetched from.
//!
//! A [`Source`] is resolved once into a closed set of variants: a URL that is downloaded over
//! HTTP, a shared future, or a callback producing a future. Sources that are not URLs have no
//! natural identity and therefore need either an explicit key or a request id to be cached.
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use url::Url;

use crate::caching::CacheError;
use crate::types::Contents;

/// The future type produced by non-URL sources.
pub type SourceFuture = BoxFuture<'static, Result<Contents, SourceError>>;

type SourceCallback = Arc<dyn Fn() -> SourceFuture + Send + Sync>;

/// A failure of the source itself.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The remote server answered with a non-success status.
    #[error("Bad response for {url} ({status}): {reason}")]
    Status {
        url: String,
        status: u16,
        reason: String,
    },
    /// The request could not be completed, for example because of a timeout.
    #[error(transparent)]
    Request(Arc<reqwest::Error>),
    /// Any other failure raised by a user supplied source.
    #[error(transparent)]
    Other(Arc<dyn Error + Send + Sync>),
}

impl SourceError {
    /// Wraps an arbitrary error.
    pub fn other<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::Other(Arc::new(err))
    }

    /// Creates an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        let boxed: Box<dyn Error + Send + Sync> = message.into().into();
        Self::Other(Arc::from(boxed))
    }

    /// The HTTP status, if this was a bad response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::Other(_) => None,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(Arc::new(err))
    }
}

/// Where the contents of an asset come from.
#[derive(Clone)]
pub enum Source {
    /// A remote URL, downloaded with the configured request options.
    Url(String),
    /// An already running computation, awaited directly.
    Future(Shared<SourceFuture>),
    /// A callback invoked once per fetch attempt.
    Callback(SourceCallback),
    /// A callback that brings its own stable identity.
    Keyed {
        key: String,
        callback: SourceCallback,
    },
}

impl Source {
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url(url.into())
    }

    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = Result<Contents, SourceError>> + Send + 'static,
    {
        Self::Future(future.boxed().shared())
    }

    pub fn callback<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Contents, SourceError>> + Send + 'static,
    {
        Self::Callback(Arc::new(move || f().boxed()))
    }

    pub fn keyed<F, Fut>(key: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Contents, SourceError>> + Send + 'static,
    {
        Self::Keyed {
            key: key.into(),
            callback: Arc::new(move || f().boxed()),
        }
    }

    /// The raw identity of this source, before any display formatting.
    ///
    /// A non-empty `request_id` always wins. Otherwise URLs identify themselves, keyed sources use
    /// their key, and bare futures and callbacks are rejected.
    pub fn identity(&self, request_id: Option<&str>) -> Result<String, CacheError> {
        if let Some(id) = request_id.filter(|id| !id.is_empty()) {
            return Ok(id.to_owned());
        }

        match self {
            Self::Url(url) if !url.is_empty() => Ok(url.clone()),
            Self::Keyed { key, .. } if !key.is_empty() => Ok(key.clone()),
            Self::Url(_) | Self::Keyed { .. } => Err(CacheError::InvalidSource(
                "source identity must not be empty".into(),
            )),
            Self::Future(_) | Self::Callback(_) => Err(CacheError::InvalidSource(format!(
                "a {} source needs a `request_id` to be cached",
                self.kind()
            ))),
        }
    }

    /// The URL if this is a URL source.
    pub fn as_url(&self) -> Option<&str> {
        match self {
            Self::Url(url) => Some(url),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Url(_) => "url",
            Self::Future(_) => "future",
            Self::Callback(_) => "callback",
            Self::Keyed { .. } => "keyed",
        }
    }

    /// Runs a non-URL source once.
    ///
    /// Returns `None` for URL sources, which have to go through the downloader instead.
    pub(crate) fn invoke(&self) -> Option<SourceFuture> {
        match self {
            Self::Url(_) => None,
            Self::Future(shared) => Some(shared.clone().boxed()),
            Self::Callback(callback) | Self::Keyed { callback, .. } => Some(callback()),
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Keyed { key, .. } => f.debug_struct("Keyed").field("key", key).finish(),
            Self::Future(_) | Self::Callback(_) => write!(f, "{}(..)", self.kind()),
        }
    }
}

impl From<&str> for Source {
    fn from(url: &str) -> Self {
        Self::Url(url.to_owned())
    }
}

impl From<String> for Source {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl From<Url> for Source {
    fn from(url: Url) -> Self {
        Self::Url(url.into())
    }
}

/// Whether the candidate parses as an absolute URL.
///
/// Relative and local paths are not full URLs.
pub fn is_full_url(candidate: &str) -> bool {
    Url::parse(candidate).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_full_url() {
        assert!(is_full_url("https://example.com/"));
        assert!(is_full_url("http://localhost:8080/a?b=c"));
        assert!(!is_full_url("./local/file.txt"));
        assert!(!is_full_url("/etc/hosts"));
        assert!(!is_full_url(""));
    }

    #[test]
    fn test_identity() {
        let source = Source::from("https://example.com/a.json");
        assert_eq!(source.identity(None).unwrap(), "https://example.com/a.json");
        assert_eq!(source.identity(Some("custom")).unwrap(), "custom");
        assert_eq!(
            source.identity(Some("")).unwrap(),
            "https://example.com/a.json"
        );

        let callback = Source::callback(|| async { Ok(Contents::from("hi")) });
        assert!(matches!(
            callback.identity(None),
            Err(CacheError::InvalidSource(_))
        ));
        assert_eq!(callback.identity(Some("my-id")).unwrap(), "my-id");

        let keyed = Source::keyed("feed", || async { Ok(Contents::from("hi")) });
        assert_eq!(keyed.identity(None).unwrap(), "feed");

        let empty = Source::keyed("", || async { Ok(Contents::from("hi")) });
        assert!(empty.identity(None).is_err());
    }

    #[test]
    fn test_status_error() {
        let err = SourceError::Status {
            url: "https://example.com/missing".into(),
            status: 404,
            reason: "Not Found".into(),
        };
        assert_eq!(err.status(), Some(404));
        assert_eq!(
            err.to_string(),
            "Bad response for https://example.com/missing (404): Not Found"
        );
    }

    #[tokio::test]
    async fn test_shared_future_invoked_twice() {
        let source = Source::future(async { Ok(Contents::from("once")) });
        let first = source.invoke().unwrap().await.unwrap();
        let second = source.invoke().unwrap().await.unwrap();
        assert_eq!(first, second);
        assert!(Source::from("https://example.com").invoke().is_none());
    }
}
