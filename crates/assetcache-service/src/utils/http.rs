use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, Method, header};
use serde_json::{Map, Value, json};

use crate::config::{Config, RequestOptions};
use crate::sources::SourceError;

pub const USER_AGENT: &str = concat!("assetcache/", env!("CARGO_PKG_VERSION"));

/// Various timeouts for the downloader
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            max_download: Duration::from_secs(315),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// Falls back to a default client if the configured one can not be built.
pub fn create_client(timeouts: &DownloadTimeouts) -> Client {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|e| {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "Failed to build HTTP client, using defaults"
            );
            Client::new()
        })
}

/// A successful HTTP response.
#[derive(Debug, Clone)]
pub struct Downloaded {
    /// The final URL, after following redirects.
    pub url: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Downloaded {
    /// The response information that is persisted alongside the cached contents.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("url".into(), json!(self.url));
        metadata.insert("status".into(), json!(self.status));
        metadata.insert("headers".into(), json!(self.headers));
        metadata
    }
}

/// Downloads URL sources.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Issues the request described by `options` against `url`.
    ///
    /// Any non-success status is an error.
    pub async fn download(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Downloaded, SourceError> {
        let method = match options.method.as_deref() {
            Some(method) if !method.is_empty() => {
                Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(SourceError::other)?
            }
            _ => Method::GET,
        };

        tracing::debug!("Fetching `{}` ({})", url, method);

        let mut builder = self.client.request(method, url);
        for (key, value) in &options.headers {
            let key = header::HeaderName::from_bytes(key.as_bytes()).map_err(SourceError::other)?;
            builder = builder.header(key, value.as_str());
        }
        if !options
            .headers
            .keys()
            .any(|key| key.eq_ignore_ascii_case(header::USER_AGENT.as_str()))
        {
            builder = builder.header(header::USER_AGENT, USER_AGENT);
        }
        if let Some(body) = &options.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_owned(),
            });
        }

        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_owned(), value.to_owned()))
            })
            .collect();
        let body = response.bytes().await?;

        Ok(Downloaded {
            url: final_url,
            status: status.as_u16(),
            headers,
            body,
        })
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new(create_client(&DownloadTimeouts::default()))
    }
}

#[cfg(test)]
mod tests {
    use assetcache_test as test;

    use super::*;

    #[tokio::test]
    async fn test_download() {
        test::setup();
        let server = test::HitCounter::new();

        let downloader = HttpDownloader::default();
        let downloaded = downloader
            .download(server.url("hello.txt").as_str(), &RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(downloaded.status, 200);
        assert_eq!(&downloaded.body[..], b"hello world\n");
        assert_eq!(downloaded.url, server.url("hello.txt").as_str());

        let metadata = downloaded.metadata();
        assert_eq!(metadata["status"], 200);
        assert!(metadata["headers"]["content-type"].is_string());
    }

    #[tokio::test]
    async fn test_download_missing() {
        test::setup();
        let server = test::HitCounter::new();

        let downloader = HttpDownloader::default();
        let url = server.url("respond_statuscode/404/missing.txt");
        let err = downloader
            .download(url.as_str(), &RequestOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(404));
        assert_eq!(
            err.to_string(),
            format!("Bad response for {url} (404): Not Found")
        );
    }

    #[tokio::test]
    async fn test_request_options() {
        test::setup();
        let server = test::HitCounter::new();

        let options = RequestOptions {
            method: Some("post".into()),
            headers: BTreeMap::from([("X-Test".into(), "1".into())]),
            body: Some("payload".into()),
        };
        let downloaded = HttpDownloader::default()
            .download(server.url("echo").as_str(), &options)
            .await
            .unwrap();

        assert_eq!(&downloaded.body[..], b"POST payload");
        assert_eq!(server.accesses(), 1);
    }

    #[tokio::test]
    async fn test_invalid_header_name() {
        test::setup();
        let server = test::HitCounter::new();

        let options = RequestOptions {
            headers: BTreeMap::from([("not a header".into(), "1".into())]),
            ..Default::default()
        };
        let err = HttpDownloader::default()
            .download(server.url("hello.txt").as_str(), &options)
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::Other(_)));
        assert_eq!(err.status(), None);
        assert_eq!(server.accesses(), 0);
    }
}
