use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, de};
use tracing::level_filters::LevelFilter;

use crate::caching::CacheDuration;
use crate::types::ContentType;

/// Maps the (possibly query-stripped) identity of a source to the name it is logged and hashed by.
pub type DisplayFormatter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Builds a cache filename out of the unique key and its hash.
pub type FilenameFormatter = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "assetcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Options passed on to the HTTP client for URL sources.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    /// The request method, `GET` if unset.
    pub method: Option<String>,
    /// Additional request headers.
    pub headers: BTreeMap<String, String>,
    /// The request body.
    pub body: Option<String>,
}

/// What a fetch resolves to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnType {
    /// Just the contents.
    #[default]
    #[serde(alias = "default")]
    Value,
    /// The contents together with the response status, headers and cache status.
    Response,
}

/// The defaults for all fetches.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How fetched contents are interpreted.
    #[serde(rename = "type")]
    pub content_type: ContentType,

    /// The directory cache entries are stored in.
    pub directory: PathBuf,

    /// How many fetches may run at the same time.
    pub concurrency: usize,

    /// Request options for URL sources.
    #[serde(alias = "fetchOptions")]
    pub fetch_options: RequestOptions,

    /// Run sources without reading from or writing to the cache.
    #[serde(alias = "dryRun")]
    pub dry_run: bool,

    /// Strip the query string off URLs before deriving their cache key.
    #[serde(alias = "removeUrlQueryParams")]
    pub remove_url_query_params: bool,

    /// Log progress at `INFO` instead of `DEBUG`.
    pub verbose: bool,

    /// The number of hex characters of the key hash used in filenames.
    #[serde(alias = "hashLength")]
    pub hash_length: usize,

    /// How long entries stay fresh.
    pub duration: CacheDuration,

    /// Whether fetches return plain contents or a response envelope.
    #[serde(alias = "returnType")]
    pub return_type: ReturnType,

    /// The number of settled fetches kept in memory in front of the file system.
    ///
    /// `0` disables the in-memory layer.
    pub in_memory_capacity: u64,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum duration of a single download.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// Internal logging.
    pub logging: Logging,

    /// Internal metrics.
    pub metrics: Metrics,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            content_type: ContentType::Buffer,
            directory: PathBuf::from(".cache"),
            concurrency: 10,
            fetch_options: RequestOptions::default(),
            dry_run: false,
            remove_url_query_params: false,
            verbose: false,
            hash_length: 30,
            duration: CacheDuration::DEFAULT,
            return_type: ReturnType::Value,
            in_memory_capacity: 0,
            connect_timeout: Duration::from_secs(10),
            max_download_timeout: Duration::from_secs(315),
            logging: Logging::default(),
            metrics: Metrics::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

/// Per-fetch overrides of the [`Config`] defaults.
///
/// Every field left at `None` falls back to the configured default.
#[derive(Clone, Default)]
pub struct FetchOptions {
    pub content_type: Option<ContentType>,
    pub directory: Option<PathBuf>,
    pub duration: Option<CacheDuration>,
    pub fetch_options: Option<RequestOptions>,
    pub dry_run: Option<bool>,
    pub remove_url_query_params: Option<bool>,
    pub verbose: Option<bool>,
    pub hash_length: Option<usize>,
    pub return_type: Option<ReturnType>,
    /// Replaces the identity of the source in its cache key.
    pub request_id: Option<String>,
    pub format_url_for_display: Option<DisplayFormatter>,
    pub filename_format: Option<FilenameFormatter>,
}

impl FetchOptions {
    pub fn with_display_formatter<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.format_url_for_display = Some(Arc::new(f));
        self
    }

    pub fn with_filename_format<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) -> String + Send + Sync + 'static,
    {
        self.filename_format = Some(Arc::new(f));
        self
    }

    /// Resolves these options against the defaults of `config`.
    pub fn merged_with(&self, config: &Config) -> FetchSettings {
        FetchSettings {
            content_type: self.content_type.unwrap_or(config.content_type),
            directory: self
                .directory
                .clone()
                .unwrap_or_else(|| config.directory.clone()),
            duration: self.duration.unwrap_or(config.duration),
            request: self
                .fetch_options
                .clone()
                .unwrap_or_else(|| config.fetch_options.clone()),
            dry_run: self.dry_run.unwrap_or(config.dry_run),
            remove_url_query_params: self
                .remove_url_query_params
                .unwrap_or(config.remove_url_query_params),
            verbose: self.verbose.unwrap_or(config.verbose),
            hash_length: self.hash_length.unwrap_or(config.hash_length),
            return_type: self.return_type.unwrap_or(config.return_type),
            request_id: self.request_id.clone(),
            format_url_for_display: self.format_url_for_display.clone(),
            filename_format: self.filename_format.clone(),
        }
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("content_type", &self.content_type)
            .field("directory", &self.directory)
            .field("duration", &self.duration)
            .field("fetch_options", &self.fetch_options)
            .field("dry_run", &self.dry_run)
            .field("remove_url_query_params", &self.remove_url_query_params)
            .field("verbose", &self.verbose)
            .field("hash_length", &self.hash_length)
            .field("return_type", &self.return_type)
            .field("request_id", &self.request_id)
            .field(
                "format_url_for_display",
                &self.format_url_for_display.is_some(),
            )
            .field("filename_format", &self.filename_format.is_some())
            .finish()
    }
}

/// The fully resolved options of a single fetch.
#[derive(Clone)]
pub struct FetchSettings {
    pub content_type: ContentType,
    pub directory: PathBuf,
    pub duration: CacheDuration,
    pub request: RequestOptions,
    pub dry_run: bool,
    pub remove_url_query_params: bool,
    pub verbose: bool,
    pub hash_length: usize,
    pub return_type: ReturnType,
    pub request_id: Option<String>,
    pub format_url_for_display: Option<DisplayFormatter>,
    pub filename_format: Option<FilenameFormatter>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        FetchOptions::default().merged_with(&Config::default())
    }
}

impl fmt::Debug for FetchSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchSettings")
            .field("content_type", &self.content_type)
            .field("directory", &self.directory)
            .field("duration", &self.duration)
            .field("request", &self.request)
            .field("dry_run", &self.dry_run)
            .field("remove_url_query_params", &self.remove_url_query_params)
            .field("verbose", &self.verbose)
            .field("hash_length", &self.hash_length)
            .field("return_type", &self.return_type)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.directory, Path::new(".cache"));
        assert_eq!(cfg.concurrency, 10);
        assert_eq!(cfg.hash_length, 30);
        assert_eq!(cfg.duration, CacheDuration::DEFAULT);
        assert_eq!(cfg.content_type, ContentType::Buffer);
        assert!(!cfg.dry_run);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
            type: structured-data
            directory: /tmp/assets
            duration: 2h
            dryRun: true
            fetch_options:
              method: POST
              headers:
                Authorization: Bearer 123
            connect_timeout: 5s
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.content_type, ContentType::Json);
        assert_eq!(cfg.directory, Path::new("/tmp/assets"));
        assert_eq!(
            cfg.duration,
            CacheDuration::Finite(Duration::from_secs(7200))
        );
        assert!(cfg.dry_run);
        assert_eq!(cfg.fetch_options.method.as_deref(), Some("POST"));
        assert_eq!(cfg.fetch_options.headers["Authorization"], "Bearer 123");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        // untouched values keep their defaults
        assert_eq!(cfg.hash_length, 30);
    }

    #[test]
    fn test_invalid_duration() {
        let result = Config::from_reader("duration: soon".as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_options_override_config() {
        let config = Config {
            verbose: true,
            hash_length: 12,
            ..Config::default()
        };
        let options = FetchOptions {
            hash_length: Some(64),
            duration: Some(CacheDuration::Forever),
            request_id: Some("my-request".into()),
            ..Default::default()
        }
        .with_display_formatter(|url| url.to_uppercase());

        let settings = options.merged_with(&config);
        assert!(settings.verbose);
        assert_eq!(settings.hash_length, 64);
        assert_eq!(settings.duration, CacheDuration::Forever);
        assert_eq!(settings.request_id.as_deref(), Some("my-request"));
        assert_eq!(
            settings.format_url_for_display.as_ref().unwrap()("abc"),
            "ABC"
        );
        assert_eq!(settings.directory, config.directory);
    }
}
