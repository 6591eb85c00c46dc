//! Helpers for testing the asset cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the cache will happily recreate the
//!    directory, and the files are leaked. To avoid this, assign it to a variable in the test
//!    function (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - When using the [`HitCounter`] server, make sure that it is held until all requests to it
//!    have been made. Once dropped, connections to its port are refused.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::http::{Method, StatusCode, header};
use axum::routing::{any, get};
use axum::{Router, extract, middleware};
use reqwest::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `assetcache_service` crate and mutes
///    all other logs (such as hyper or reqwest).
pub fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("assetcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The markup served under `/feed.xml`.
pub const FEED_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed lang="en">
  <title>Example Feed</title>
  <entry id="1">First</entry>
  <entry id="2">Second</entry>
</feed>
"#;

/// A web server with a fixed set of routes that counts every request by its URI.
///
/// Routes:
///
/// - `/hello.txt`: the text `hello world\n`.
/// - `/data.json`: a small JSON document.
/// - `/feed.xml`: [`FEED_XML`].
/// - `/binary.bin`: a few raw bytes.
/// - `/empty.bin`: an empty body.
/// - `/echo`: any method, responds with `"<METHOD> <body>"`.
/// - `/query`: responds with the raw query string.
/// - `/slow/:time/*tail`: waits for the given [`humantime`] duration, then responds with `tail`.
/// - `/flaky/*tail`: responds with `tail`, or a `500` while [`set_failing`](Self::set_failing).
/// - `/respond_statuscode/:num/*tail`: responds with the given status code.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
    failing: Arc<AtomicBool>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));
        let failing = Arc::new(AtomicBool::new(false));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri,
                  req: extract::Request,
                  next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route("/hello.txt", get(|| async { "hello world\n" }))
            .route(
                "/data.json",
                get(|| async {
                    (
                        [(header::CONTENT_TYPE, "application/json")],
                        r#"{"name":"assetcache","x":1}"#,
                    )
                }),
            )
            .route(
                "/feed.xml",
                get(|| async { ([(header::CONTENT_TYPE, "application/xml")], FEED_XML) }),
            )
            .route("/binary.bin", get(|| async { vec![0u8, 1, 2, 3, 255] }))
            .route("/empty.bin", get(|| async { Vec::<u8>::new() }))
            .route(
                "/echo",
                any(|method: Method, body: String| async move { format!("{method} {body}") }),
            )
            .route(
                "/query",
                get(|extract::RawQuery(query): extract::RawQuery| async move {
                    query.unwrap_or_else(|| "none".into())
                }),
            )
            .route(
                "/slow/:time/*tail",
                get(
                    |extract::Path((time, tail)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;
                        tail
                    },
                ),
            )
            .route(
                "/flaky/*tail",
                get({
                    let failing = failing.clone();
                    move |extract::Path(tail): extract::Path<String>| async move {
                        if failing.load(Ordering::SeqCst) {
                            Err(StatusCode::INTERNAL_SERVER_ERROR)
                        } else {
                            Ok(tail)
                        }
                    }
                }),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self {
            server,
            hits,
            failing,
        }
    }

    /// Returns the number of requests since the last call, and resets the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns all hits by URI since the last call, and resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// Makes the `/flaky` route fail until set back to `false`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}
