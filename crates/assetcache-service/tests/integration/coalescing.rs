use std::sync::Arc;
use std::time::{Duration, Instant};

use assetcache_service::config::FetchOptions;
use assetcache_service::types::Contents;
use futures::future::join_all;

use crate::{HitCounter, setup_service};

#[tokio::test]
async fn test_concurrent_fetches_share_one_download() {
    let (service, _cache_dir) = setup_service(|_| ());
    let server = HitCounter::new();
    let url = server.url("slow/100ms/shared.txt");

    let fetches = (0..5).map(|_| service.fetch(url.clone(), &FetchOptions::default()));
    let results: Vec<_> = join_all(fetches)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(server.accesses(), 1);
    assert_eq!(
        results[0].contents(),
        &Contents::from(b"shared.txt".to_vec())
    );
    assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    assert_eq!(service.in_flight(), 0);
}

#[tokio::test]
async fn test_coalesced_failures_are_not_remembered() {
    let (service, cache_dir) = setup_service(|config| {
        config.dry_run = true;
    });
    let server = HitCounter::new();
    let url = server.url("respond_statuscode/404/missing.txt");

    let (a, b) = futures::join!(
        service.fetch(url.clone(), &FetchOptions::default()),
        service.fetch(url.clone(), &FetchOptions::default()),
    );
    let (a, b) = (a.unwrap_err(), b.unwrap_err());
    assert_eq!(a.to_string(), b.to_string());
    assert_eq!(server.accesses(), 1);

    // the next call tries again
    let c = service.fetch(url, &FetchOptions::default()).await;
    assert!(c.unwrap_err().is_source_failure());
    assert_eq!(server.accesses(), 1);
    assert!(crate::cache_files(cache_dir.path()).is_empty());
}

#[tokio::test]
async fn test_concurrency_limit() {
    let (service, _cache_dir) = setup_service(|config| {
        config.concurrency = 3;
    });
    let server = HitCounter::new();
    assert_eq!(service.concurrency(), 3);

    service.set_concurrency(1);
    assert_eq!(service.concurrency(), 1);

    let start = Instant::now();
    let fetches = ["a", "b", "c"].map(|name| {
        let url = server.url(&format!("slow/100ms/{name}"));
        service.fetch(url, &FetchOptions::default())
    });
    for result in join_all(fetches).await {
        result.unwrap();
    }

    // one at a time
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_eq!(server.accesses(), 3);
}
