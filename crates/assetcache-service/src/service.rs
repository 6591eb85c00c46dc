//! Provides [`AssetFetchService`], the context object owning all state shared between fetches.
//!
//! Every service has its own concurrency limiter, in-flight map, file-system memoization and HTTP
//! client. Independent services never observe each other, apart from the files they share on
//! disk. [`AssetFetchService::global`] offers a lazily created default instance for the common
//! case of one service per application.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use futures::future::{self, BoxFuture, FutureExt};

use crate::caching::{
    AssetCache, CacheError, CacheFs, CacheKey, FetchContext, FetchQueue, FetchResult, FrontCache,
    RemoteAssetCache, RequestCoalescer,
};
use crate::config::{Config, FetchOptions};
use crate::sources::{Source, is_full_url};
use crate::utils::http::{DownloadTimeouts, HttpDownloader, create_client};

static GLOBAL_SERVICE: OnceLock<AssetFetchService> = OnceLock::new();

/// Fetches assets through the cache.
///
/// Cloning is cheap, all clones share the same state.
#[derive(Clone, Debug)]
pub struct AssetFetchService {
    inner: Arc<ServiceInner>,
}

#[derive(Debug)]
struct ServiceInner {
    config: Config,
    context: FetchContext,
    queue: FetchQueue,
    coalescer: RequestCoalescer,
}

impl AssetFetchService {
    pub fn new(config: Config) -> Self {
        let timeouts = DownloadTimeouts::from_config(&config);
        let downloader = HttpDownloader::new(create_client(&timeouts));

        let front = (config.in_memory_capacity > 0).then(|| {
            FrontCache::builder()
                .max_capacity(config.in_memory_capacity)
                .name("assetcache-front")
                .build()
        });

        let context = FetchContext {
            fs: CacheFs::default(),
            downloader,
            front,
        };

        Self {
            inner: Arc::new(ServiceInner {
                queue: FetchQueue::new(config.concurrency),
                coalescer: RequestCoalescer::new(),
                context,
                config,
            }),
        }
    }

    /// The default service, created with [`Config::default`] on first use.
    pub fn global() -> &'static Self {
        GLOBAL_SERVICE.get_or_init(|| Self::new(Config::default()))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Fetches `source`, serving it from the cache where possible.
    ///
    /// Concurrent fetches resolving to the same unique key share a single execution, and thus
    /// the very same result. Executions wait for a slot of the concurrency limiter.
    ///
    /// NOTE: This function is *not* `async`, the fetch is spawned eagerly and has to be called
    /// from within a tokio runtime.
    pub fn fetch(
        &self,
        source: impl Into<Source>,
        options: &FetchOptions,
    ) -> BoxFuture<'static, FetchResult> {
        let remote = match self.remote_asset_cache(source, options) {
            Ok(remote) => remote,
            Err(err) => return future::ready(Err(err)).boxed(),
        };

        let key = coalescing_key(&remote);
        self.queue(key, move || remote.fetch())
    }

    /// Runs `produce` under the concurrency limit, joining a running execution for `key`.
    ///
    /// This is the building block of [`fetch`](Self::fetch), exposed for callers that drive a
    /// [`RemoteAssetCache`] or their own computation manually. `produce` is not called if an
    /// execution for `key` is already in flight.
    pub fn queue<F, Fut>(&self, key: String, produce: F) -> BoxFuture<'static, FetchResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        let queue = self.inner.queue.clone();
        self.inner.coalescer.coalesce(key, move || {
            let computation = produce();
            async move { queue.run(computation).await }.boxed()
        })
    }

    /// Creates the fetcher for `source` within this service's context.
    ///
    /// URL sources have to be absolute URLs.
    pub fn remote_asset_cache(
        &self,
        source: impl Into<Source>,
        options: &FetchOptions,
    ) -> Result<RemoteAssetCache, CacheError> {
        let source = source.into();
        if let Some(url) = source.as_url() {
            if !is_full_url(url) {
                return Err(CacheError::InvalidSource(
                    "Caching an already local asset is not yet supported.".into(),
                ));
            }
        }

        let settings = options.merged_with(&self.inner.config);
        RemoteAssetCache::new(source, settings, self.inner.context.clone())
    }

    /// Opens the cache entry for `key` directly, without any source attached.
    pub fn asset_cache(
        &self,
        key: CacheKey,
        options: &FetchOptions,
    ) -> Result<AssetCache, CacheError> {
        let settings = options.merged_with(&self.inner.config);
        AssetCache::new(key, &settings, self.inner.context.fs.clone())
    }

    /// The number of fetches allowed to run at once.
    pub fn concurrency(&self) -> usize {
        self.inner.queue.concurrency()
    }

    /// Changes the number of fetches allowed to run at once.
    ///
    /// Fetches that are already running are not interrupted when the limit shrinks.
    pub fn set_concurrency(&self, concurrency: usize) {
        tracing::debug!(concurrency, "Changing fetch concurrency");
        self.inner.queue.set_concurrency(concurrency);
    }

    /// The number of distinct executions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.coalescer.in_flight()
    }
}

/// Dry runs neither read nor write the cache, so they must not join real fetches, or the other
/// way around.
fn coalescing_key(remote: &RemoteAssetCache) -> String {
    let mut key = remote.uid();
    if remote.settings().dry_run {
        key.push_str(",dry-run");
    }
    key
}
