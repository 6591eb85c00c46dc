//! # Asset caching infrastructure
//!
//! Fetching remote assets is slow and flaky, so every result is persisted to the file system and
//! served from there for as long as it is fresh.
//! This module includes all the code that deals with the different layers of caching, our central
//! [`CacheError`] type, and explains how the pieces fit together.
//!
//! ## Cache Layers
//!
//! - Request coalescing ([`RequestCoalescer`]): concurrent requests for the same key share a
//!   single in-flight computation. Entries are dropped as soon as the computation settles.
//! - An optional in-memory layer of settled values, bounded by
//!   [`Config::in_memory_capacity`](crate::config::Config::in_memory_capacity).
//! - The file-system layer ([`AssetCache`]), one metadata file plus one content file per entry.
//!
//! A fetch goes through the following steps:
//! - It waits for a slot in the [`FetchQueue`], and joins a running computation for the same key.
//! - Unless this is a dry run, the in-memory and file-system layers are consulted. A fresh entry
//!   is returned right away.
//! - Otherwise the source is invoked. On success the result is written to the file system.
//! - If the source fails and *any* entry exists, even an expired one, that entry is returned
//!   instead of the error.
//!
//! ## Cache keys
//!
//! A [`CacheKey`] is built from the identity of the source (its URL, or an explicit request id),
//! a non-default request method and body, and the requested content type where that changes what
//! is stored. The key parts are hashed with SHA-256 and the hex digest, truncated to the
//! configured length, names the files on disk.
//!
//! ## Files
//!
//! For an entry named `assetcache-<hash>`, the directory contains:
//!
//! - `assetcache-<hash>`: a JSON record `{"cachedAt": <millis>, "type": "<type>", "metadata": {..}}`.
//! - `assetcache-<hash>.<buffer|text|json>`: the contents.
//!
//! Both files are written through a temporary file that is persisted over the target, and the
//! contents are always written before the record that refers to them.
//!
//! ### Metrics
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory layer.
//! - `caches.file.hit`: Accesses served by the file-system layer.
//! - `caches.file.miss`: Accesses that had to invoke the source.
//! - `caches.computation`: Actual source invocations.
//! - `caches.file.write`: The number of entries written to disk.
//! - `caches.file.size`: The size of every content file written, sent as a timer.
//! - `caches.fallback`: Failed source invocations answered with an expired entry.
//! - `caches.channel.hit` / `caches.channel.miss`: Requests that did or did not join an
//!   in-flight computation.
//! - `fetch_queue.concurrency`: A gauge of the current concurrency limit.

mod asset_cache;
mod cache_error;
mod cache_key;
mod coalesce;
mod duration;
mod file_cache;
mod fs;
mod metadata;
mod queue;
mod remote;


pub use asset_cache::AssetCache;
pub use cache_error::CacheError;
pub use cache_key::{CacheKey, CacheKeyBuilder, get_hash};
pub use coalesce::RequestCoalescer;
pub use duration::CacheDuration;
pub use file_cache::FileCache;
pub use fs::{CacheFs, DirectoryManager, ExistenceProbe};
pub use metadata::{Metadata, StoredRecord, decode_legacy, decode_record};
pub use queue::FetchQueue;
pub use remote::{
    CacheStatus, FetchContext, FetchOutput, FetchResponse, FetchResult, FrontCache, FrontEntry,
    RemoteAssetCache, clean_url,
};
