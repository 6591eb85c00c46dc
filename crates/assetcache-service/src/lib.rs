//! A disk-backed cache for the results of remote fetches and other asynchronous sources.
//!
//! The entry point is [`AssetFetchService`](service::AssetFetchService), which owns all the
//! process-wide state (the concurrency limiter, the in-flight request map and the file-system
//! memoization) so that independent instances never share hidden globals.
//! See the [`caching`] module for how the layers fit together.

#[macro_use]
pub mod metrics;

#[macro_use]
pub mod logging;

pub mod caching;
pub mod config;
pub mod service;
pub mod sources;
pub mod types;
pub mod utils;

pub use caching::{AssetCache, CacheError, CacheKey, RemoteAssetCache, get_hash};
pub use config::{Config, FetchOptions};
pub use service::AssetFetchService;
pub use sources::{Source, SourceError, is_full_url};
pub use types::{ContentType, Contents};
