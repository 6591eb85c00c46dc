use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use url::Url;

use crate::config::{FetchSettings, ReturnType};
use crate::sources::{Source, SourceError};
use crate::types::Contents;
use crate::utils::http::HttpDownloader;

use super::asset_cache::AssetCache;
use super::fs::CacheFs;
use super::{CacheError, CacheKey};

/// The outcome of a fetch, shared by every caller that waited on it.
pub type FetchResult = Result<Arc<FetchOutput>, CacheError>;

type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// The optional in-memory layer in front of the file system, keyed by the metadata file path.
pub type FrontCache = moka::future::Cache<PathBuf, Arc<FrontEntry>>;

/// A settled fetch kept in the [`FrontCache`].
#[derive(Debug, Clone)]
pub struct FrontEntry {
    cached_at: DateTime<Utc>,
    contents: Contents,
    metadata: Map<String, Value>,
}

/// Where the returned contents came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// A fresh cache entry.
    Hit,
    /// The source was invoked.
    Miss,
    /// The source failed and an expired entry was used instead.
    Stale,
}

/// The response envelope returned for [`ReturnType::Response`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub url: String,
    /// The HTTP status, `None` for sources that are not URLs.
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub body: Contents,
    pub cache: CacheStatus,
}

/// What a fetch resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutput {
    Value(Contents),
    Response(FetchResponse),
}

impl FetchOutput {
    /// The fetched contents, regardless of the return type.
    pub fn contents(&self) -> &Contents {
        match self {
            Self::Value(contents) => contents,
            Self::Response(response) => &response.body,
        }
    }

    /// The cache status, only tracked for response envelopes.
    pub fn cache_status(&self) -> Option<CacheStatus> {
        match self {
            Self::Value(_) => None,
            Self::Response(response) => Some(response.cache),
        }
    }
}

/// The collaborators shared by all [`RemoteAssetCache`]s of one context.
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    pub fs: CacheFs,
    pub downloader: HttpDownloader,
    pub front: Option<FrontCache>,
}

/// Fetches one source through its [`AssetCache`] entry.
///
/// Serves fresh entries from the cache, invokes the source otherwise, and falls back to an
/// expired entry if the source fails. Overlapping calls to [`fetch`](Self::fetch) on the same
/// instance share one execution.
#[derive(Clone)]
pub struct RemoteAssetCache {
    inner: Arc<Inner>,
}

struct Inner {
    source: Source,
    display: String,
    settings: FetchSettings,
    cache: AssetCache,
    context: FetchContext,
    in_flight: Mutex<Option<WeakShared<BoxFuture<'static, FetchResult>>>>,
}

impl fmt::Debug for RemoteAssetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAssetCache")
            .field("source", &self.inner.source)
            .field("display", &self.inner.display)
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

impl RemoteAssetCache {
    pub fn new(
        source: Source,
        settings: FetchSettings,
        context: FetchContext,
    ) -> Result<Self, CacheError> {
        let (key, display) = Self::cache_key(&source, &settings)?;
        let cache = AssetCache::new(key, &settings, context.fs.clone())?;

        Ok(Self {
            inner: Arc::new(Inner {
                source,
                display,
                settings,
                cache,
                context,
                in_flight: Mutex::new(None),
            }),
        })
    }

    /// Derives the cache key and the display identity of `source`.
    ///
    /// Query parameters are stripped first if requested, then the display formatter runs. The
    /// display identity is what ends up being hashed.
    pub fn cache_key(
        source: &Source,
        settings: &FetchSettings,
    ) -> Result<(CacheKey, String), CacheError> {
        let has_request_id = settings.request_id.as_deref().is_some_and(|id| !id.is_empty());
        let mut identity = source.identity(settings.request_id.as_deref())?;
        if settings.remove_url_query_params && source.as_url().is_some() && !has_request_id {
            identity = clean_url(&identity);
        }

        let display = match &settings.format_url_for_display {
            Some(format) => format(&identity),
            None => identity,
        };

        let key = CacheKey::builder(display.clone())
            .request_shape(
                settings.request.method.as_deref(),
                settings.request.body.as_deref(),
            )
            .interpretation(settings.content_type)
            .build()?;

        Ok((key, display))
    }

    /// The comma-joined key parts identifying `source` for request coalescing.
    pub fn get_uid(source: &Source, settings: &FetchSettings) -> Result<String, CacheError> {
        Ok(Self::cache_key(source, settings)?.0.uid())
    }

    pub fn source(&self) -> &Source {
        &self.inner.source
    }

    /// The identity used in log lines.
    pub fn display(&self) -> &str {
        &self.inner.display
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.inner.settings
    }

    /// The underlying cache entry.
    pub fn cache(&self) -> &AssetCache {
        &self.inner.cache
    }

    pub fn uid(&self) -> String {
        self.inner.cache.key().uid()
    }

    pub fn cache_path(&self) -> &Path {
        self.inner.cache.cache_path()
    }

    /// Whether the entry is fresh according to the configured duration.
    pub async fn is_cache_valid(&self) -> Result<bool, CacheError> {
        let duration = self.inner.settings.duration;
        self.inner.cache.is_cache_valid(Some(duration)).await
    }

    pub async fn has_cache_files(&self) -> bool {
        self.inner.cache.has_cache_files().await
    }

    /// Deletes the files of this entry, and drops it from the in-memory layer.
    pub async fn destroy(&self) -> Result<(), CacheError> {
        if let Some(front) = &self.inner.context.front {
            front.invalidate(self.cache_path()).await;
        }
        self.inner.cache.destroy().await
    }

    /// Fetches the contents of this source.
    ///
    /// Calls overlapping with a running fetch of this instance get that fetch's result.
    ///
    /// NOTE: The returned future is lazy, it has to be polled for the fetch to make progress.
    pub fn fetch(&self) -> BoxFuture<'static, FetchResult> {
        let mut in_flight = self.inner.in_flight.lock();
        if let Some(shared) = in_flight.as_ref().and_then(WeakShared::upgrade) {
            return shared.boxed();
        }

        let this = self.clone();
        let shared: SharedFetch = async move {
            let result = this.fetch_uncoalesced().await;
            *this.inner.in_flight.lock() = None;
            result
        }
        .boxed()
        .shared();

        *in_flight = shared.downgrade();
        shared.boxed()
    }

    async fn fetch_uncoalesced(&self) -> FetchResult {
        let settings = &self.inner.settings;
        let display_name = &self.inner.display;
        let verbose = settings.verbose;

        metric!(counter("caches.access") += 1);

        // dry runs never read from the cache
        if !settings.dry_run {
            if let Some(output) = self.lookup_front().await {
                metric!(counter("caches.memory.hit") += 1);
                log_progress!(verbose, "Cache hit for {}", display_name);
                return Ok(output);
            }

            match self.lookup_file().await {
                Ok(Some(output)) => {
                    metric!(counter("caches.file.hit") += 1);
                    log_progress!(verbose, "Cache hit for {}", display_name);
                    return Ok(output);
                }
                Ok(None) => {
                    metric!(counter("caches.file.miss") += 1);
                }
                Err(CacheError::Malformed(details)) => {
                    metric!(counter("caches.file.miss") += 1);
                    tracing::warn!(cache_path = %self.cache_path().display(), "Ignoring malformed cache entry: {details}");
                }
                Err(err) => return Err(err),
            }
        }

        let verb = if settings.dry_run { "Fetching" } else { "Cache miss for" };
        log_progress!(verbose, "{} {}", verb, display_name);
        metric!(counter("caches.computation") += 1);

        match self.invoke_source().await {
            Ok((contents, metadata)) => {
                if !settings.dry_run {
                    self.inner
                        .cache
                        .save(contents.clone(), settings.content_type, metadata.clone())
                        .await?;
                    self.remember(contents.clone(), metadata.clone()).await;
                }
                Ok(Arc::new(self.output(contents, &metadata, CacheStatus::Miss)))
            }
            Err(cause) => {
                if !settings.dry_run {
                    if let Some(output) = self.stale_output().await {
                        log_progress!(verbose, "Error fetching {}. Message: {}", display_name, cause);
                        log_progress!(verbose, "Failing gracefully with an expired cache entry.");
                        metric!(counter("caches.fallback") += 1);
                        return Ok(output);
                    }
                }
                Err(CacheError::SourceFailure {
                    display: display_name.clone(),
                    cause,
                })
            }
        }
    }

    async fn lookup_front(&self) -> Option<Arc<FetchOutput>> {
        let front = self.inner.context.front.as_ref()?;
        let entry = front.get(self.cache_path()).await?;
        if !self.inner.settings.duration.is_fresh(entry.cached_at, Utc::now()) {
            return None;
        }
        Some(Arc::new(self.output(
            entry.contents.clone(),
            &entry.metadata,
            CacheStatus::Hit,
        )))
    }

    async fn lookup_file(&self) -> Result<Option<Arc<FetchOutput>>, CacheError> {
        let cache = &self.inner.cache;
        if !self.is_cache_valid().await? {
            return Ok(None);
        }
        let Some(metadata) = cache.cached_record().await? else {
            return Ok(None);
        };
        let Some(contents) = cache.get_cached_value().await? else {
            return Ok(None);
        };

        Ok(Some(Arc::new(self.output(
            contents,
            &metadata.metadata,
            CacheStatus::Hit,
        ))))
    }

    /// Any previously cached value, regardless of its age.
    async fn stale_output(&self) -> Option<Arc<FetchOutput>> {
        let cache = &self.inner.cache;
        let metadata = cache.cached_record().await.ok()??;
        let contents = cache.get_cached_value().await.ok()??;
        Some(Arc::new(self.output(
            contents,
            &metadata.metadata,
            CacheStatus::Stale,
        )))
    }

    async fn invoke_source(&self) -> Result<(Contents, Map<String, Value>), SourceError> {
        if let Some(future) = self.inner.source.invoke() {
            return Ok((future.await?, Map::new()));
        }

        let url = self.inner.source.as_url().unwrap_or(&self.inner.display);
        let settings = &self.inner.settings;
        let downloaded = self
            .inner
            .context
            .downloader
            .download(url, &settings.request)
            .await?;
        let metadata = downloaded.metadata();
        let contents = Contents::decode(settings.content_type, downloaded.body).map_err(|e| {
            SourceError::msg(format!(
                "Response for {} is not valid {}: {e}",
                self.inner.display, settings.content_type
            ))
        })?;

        Ok((contents, metadata))
    }

    async fn remember(&self, contents: Contents, metadata: Map<String, Value>) {
        if let Some(front) = &self.inner.context.front {
            let entry = FrontEntry {
                cached_at: Utc::now(),
                contents,
                metadata,
            };
            front
                .insert(self.cache_path().to_owned(), Arc::new(entry))
                .await;
        }
    }

    fn output(
        &self,
        contents: Contents,
        metadata: &Map<String, Value>,
        cache: CacheStatus,
    ) -> FetchOutput {
        match self.inner.settings.return_type {
            ReturnType::Value => FetchOutput::Value(contents),
            ReturnType::Response => {
                let url = metadata
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or(&self.inner.display)
                    .to_owned();
                let status = metadata
                    .get("status")
                    .and_then(Value::as_u64)
                    .and_then(|status| u16::try_from(status).ok());
                let headers = metadata
                    .get("headers")
                    .and_then(|headers| serde_json::from_value(headers.clone()).ok())
                    .unwrap_or_default();

                FetchOutput::Response(FetchResponse {
                    url,
                    status,
                    headers,
                    body: contents,
                    cache,
                })
            }
        }
    }
}

/// Removes the query string from `url`.
///
/// Anything that does not parse as a URL is returned unchanged.
pub fn clean_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.into()
        }
        Err(_) => url.to_owned(),
    }
}
