use std::time::Duration;

use assetcache_service::caching::{CacheDuration, CacheError, CacheStatus};
use assetcache_service::config::{FetchOptions, ReturnType};
use assetcache_service::types::{ContentType, Contents};

use crate::{HitCounter, cache_files, setup_service};

#[tokio::test]
async fn test_expired_entry_on_failure() {
    let (service, _cache_dir) = setup_service(|config| {
        config.content_type = ContentType::Text;
        config.return_type = ReturnType::Response;
        config.verbose = true;
    });
    let server = HitCounter::new();
    let url = server.url("flaky/asset.txt");
    let options = FetchOptions {
        duration: Some(CacheDuration::Finite(Duration::ZERO)),
        ..Default::default()
    };

    let fresh = service.fetch(url.clone(), &options).await.unwrap();
    assert_eq!(fresh.contents(), &Contents::from("asset.txt"));
    assert_eq!(fresh.cache_status(), Some(CacheStatus::Miss));

    server.set_failing(true);
    let stale = service.fetch(url.clone(), &options).await.unwrap();
    assert_eq!(stale.contents(), &Contents::from("asset.txt"));
    assert_eq!(stale.cache_status(), Some(CacheStatus::Stale));
    assert_eq!(server.accesses(), 2);

    server.set_failing(false);
    let refreshed = service.fetch(url, &options).await.unwrap();
    assert_eq!(refreshed.cache_status(), Some(CacheStatus::Miss));
}

#[tokio::test]
async fn test_failure_without_entry() {
    let (service, cache_dir) = setup_service(|_| ());
    let server = HitCounter::new();
    let url = server.url("respond_statuscode/500/b.txt");

    let err = service
        .fetch(url.clone(), &FetchOptions::default())
        .await
        .unwrap_err();

    let CacheError::SourceFailure { display, cause } = &err else {
        panic!("unexpected error: {err:?}");
    };
    assert_eq!(display, url.as_str());
    assert_eq!(cause.status(), Some(500));
    assert_eq!(
        cause.to_string(),
        format!("Bad response for {url} (500): Internal Server Error")
    );
    assert!(cache_files(cache_dir.path()).is_empty());
}

#[tokio::test]
async fn test_dry_run_never_degrades() {
    let (service, cache_dir) = setup_service(|config| {
        config.content_type = ContentType::Text;
    });
    let server = HitCounter::new();
    let url = server.url("flaky/dry.txt");

    service
        .fetch(url.clone(), &FetchOptions::default())
        .await
        .unwrap();
    let files = cache_files(cache_dir.path());

    server.set_failing(true);
    let dry_run = FetchOptions {
        dry_run: Some(true),
        ..Default::default()
    };
    let err = service.fetch(url, &dry_run).await.unwrap_err();
    assert!(err.is_source_failure());
    assert_eq!(cache_files(cache_dir.path()), files);
}
