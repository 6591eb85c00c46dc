use assetcache_service::caching::{CacheStatus, FetchOutput};
use assetcache_service::config::{FetchOptions, RequestOptions, ReturnType};
use assetcache_service::types::{ContentType, Contents};
use serde_json::json;

use crate::{HitCounter, cache_files, setup_service};

fn of_type(content_type: ContentType) -> FetchOptions {
    FetchOptions {
        content_type: Some(content_type),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_fetch_is_cached() {
    let (service, cache_dir) = setup_service(|_| ());
    let server = HitCounter::new();
    let options = of_type(ContentType::Text);

    let first = service
        .fetch(server.url("hello.txt"), &options)
        .await
        .unwrap();
    assert_eq!(first.contents(), &Contents::from("hello world\n"));
    assert_eq!(server.accesses(), 1);

    let second = service
        .fetch(server.url("hello.txt"), &options)
        .await
        .unwrap();
    assert_eq!(second.contents(), first.contents());
    assert_eq!(server.accesses(), 0);

    let files = cache_files(cache_dir.path());
    assert_eq!(files.len(), 2);
    assert!(files.iter().any(|name| name.ends_with(".text")));
}

#[tokio::test]
async fn test_fetch_types() {
    let (service, _cache_dir) = setup_service(|_| ());
    let server = HitCounter::new();

    let binary = service
        .fetch(server.url("binary.bin"), &FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(&binary.contents().as_bytes().unwrap()[..], &[0u8, 1, 2, 3, 255]);

    let data = service
        .fetch(server.url("data.json"), &of_type(ContentType::Json))
        .await
        .unwrap();
    assert_eq!(
        data.contents().as_json().unwrap(),
        &json!({"name": "assetcache", "x": 1})
    );

    let parsed = service
        .fetch(server.url("feed.xml"), &of_type(ContentType::ParsedXml))
        .await
        .unwrap();
    let feed = parsed.contents().as_markup().unwrap();
    assert_eq!(feed.name, "feed");
    assert_eq!(feed.attributes["lang"], "en");
    let entries: Vec<_> = feed.elements("entry").map(|e| e.text()).collect();
    assert_eq!(entries, ["First", "Second"]);

    // raw markup is stored under a different key than the parsed tree
    let raw = service
        .fetch(server.url("feed.xml"), &of_type(ContentType::Xml))
        .await
        .unwrap();
    assert!(raw.contents().as_text().unwrap().contains("<entry id=\"2\">"));

    assert_eq!(server.accesses(), 4);
}

#[tokio::test]
async fn test_empty_binary_is_cached() {
    let (service, cache_dir) = setup_service(|_| ());
    let server = HitCounter::new();

    for expected_accesses in [1, 0] {
        let output = service
            .fetch(server.url("empty.bin"), &FetchOptions::default())
            .await
            .unwrap();
        assert!(output.contents().as_bytes().unwrap().is_empty());
        assert_eq!(server.accesses(), expected_accesses);
    }

    let files = cache_files(cache_dir.path());
    assert!(files.iter().any(|name| name.ends_with(".buffer")));
}

#[tokio::test]
async fn test_invalid_body() {
    let (service, cache_dir) = setup_service(|_| ());
    let server = HitCounter::new();

    let err = service
        .fetch(server.url("hello.txt"), &of_type(ContentType::Json))
        .await
        .unwrap_err();
    assert!(err.is_source_failure());
    assert!(cache_files(cache_dir.path()).is_empty());
}

#[tokio::test]
async fn test_response_envelope() {
    let (service, _cache_dir) = setup_service(|config| {
        config.return_type = ReturnType::Response;
        config.content_type = ContentType::Json;
    });
    let server = HitCounter::new();

    let output = service
        .fetch(server.url("data.json"), &FetchOptions::default())
        .await
        .unwrap();
    let FetchOutput::Response(miss) = &*output else {
        panic!("expected a response envelope");
    };
    assert_eq!(miss.cache, CacheStatus::Miss);
    assert_eq!(miss.status, Some(200));
    assert_eq!(miss.url, server.url("data.json").as_str());
    assert_eq!(miss.headers["content-type"], "application/json");

    let output = service
        .fetch(server.url("data.json"), &FetchOptions::default())
        .await
        .unwrap();
    let FetchOutput::Response(hit) = &*output else {
        panic!("expected a response envelope");
    };
    assert_eq!(hit.cache, CacheStatus::Hit);
    assert_eq!(hit.status, miss.status);
    assert_eq!(hit.headers, miss.headers);
    assert_eq!(hit.body, miss.body);
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_remove_url_query_params() {
    let (service, _cache_dir) = setup_service(|config| {
        config.content_type = ContentType::Text;
    });
    let server = HitCounter::new();

    let fetch_query = |query: &str, strip: bool| {
        let mut url = server.url("query");
        url.set_query(Some(query));
        let options = FetchOptions {
            remove_url_query_params: Some(strip),
            ..Default::default()
        };
        service.fetch(url, &options)
    };

    // the query is still sent, it just does not count towards the key
    let first = fetch_query("a=1", true).await.unwrap();
    assert_eq!(first.contents(), &Contents::from("a=1"));
    let second = fetch_query("a=2", true).await.unwrap();
    assert_eq!(second.contents(), &Contents::from("a=1"));
    assert_eq!(server.accesses(), 1);

    let unstripped = fetch_query("a=2", false).await.unwrap();
    assert_eq!(unstripped.contents(), &Contents::from("a=2"));
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_request_options_affect_key() {
    let (service, _cache_dir) = setup_service(|config| {
        config.content_type = ContentType::Text;
    });
    let server = HitCounter::new();

    let post = FetchOptions {
        fetch_options: Some(RequestOptions {
            method: Some("POST".into()),
            body: Some("payload".into()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let explicit_get = FetchOptions {
        fetch_options: Some(RequestOptions {
            method: Some("get".into()),
            ..Default::default()
        }),
        ..Default::default()
    };

    let posted = service.fetch(server.url("echo"), &post).await.unwrap();
    assert_eq!(posted.contents(), &Contents::from("POST payload"));

    let got = service
        .fetch(server.url("echo"), &FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(got.contents(), &Contents::from("GET "));
    assert_eq!(server.accesses(), 2);

    // an explicit GET is the same request as the default one
    let got_again = service.fetch(server.url("echo"), &explicit_get).await.unwrap();
    assert_eq!(got_again.contents(), got.contents());
    assert_eq!(server.accesses(), 0);
}
