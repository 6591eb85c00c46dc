use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use assetcache_service::caching::CacheDuration;
use assetcache_service::config::{Config, FetchOptions, LogFormat, ReturnType};
use assetcache_service::types::ContentType;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tracing::level_filters::LevelFilter;

/// The name of the configuration file.
pub const CONFIG_RC_FILE_NAME: &str = ".assetclirc";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Prints text as is, structured contents as JSON and the size of binary contents.
    Plain,
    /// Prints the entire result as one JSON document.
    Json,
}

/// Fetches an asset through the local asset cache.
///
/// Cache defaults can be put into `~/.assetclirc` or an `.assetclirc` in the current directory or
/// one of its parents. Command line options take precedence over both.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about)]
struct Cli {
    /// The URL to fetch.
    pub source: String,

    /// How the fetched contents are interpreted.
    ///
    /// Possible values:
    /// binary, text, structured-data, raw-markup, structured-markup
    #[arg(long = "type")]
    pub content_type: Option<ContentType>,

    /// How long cached contents stay fresh, for example `30m`, `1d` or `*`.
    #[arg(long)]
    pub duration: Option<CacheDuration>,

    /// The cache directory.
    #[arg(long)]
    pub directory: Option<PathBuf>,

    /// Fetch without reading from or writing to the cache.
    #[arg(long)]
    pub dry_run: bool,

    /// Ignore the query string of the URL when looking it up in the cache.
    #[arg(long)]
    pub remove_url_query_params: bool,

    /// Log cache hits and misses.
    #[arg(long, short)]
    pub verbose: bool,

    /// Print the response status, headers and cache status along with the contents.
    #[arg(long)]
    pub response: bool,

    /// A YAML configuration file with the service defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// The output format.
    #[arg(long, value_enum, default_value = "plain")]
    format: OutputFormat,

    /// The severity level of logging output.
    ///
    /// Possible values:
    /// off, error, warn, info, debug, trace
    #[arg(long, default_value = "warn")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    pub directory: Option<PathBuf>,
    pub duration: Option<CacheDuration>,
    #[serde(rename = "type")]
    pub content_type: Option<ContentType>,
    pub concurrency: Option<usize>,
    pub hash_length: Option<usize>,
    pub verbose: Option<bool>,
}

impl ConfigFile {
    pub fn parse(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(buf) => toml::from_str(&buf).context("Could not parse configuration file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).context(format!(
                "Could not read configuration file at {}",
                path.display()
            )),
        }
    }

    /// Fills in every value that is unset in `self` from `other`.
    fn or(self, other: Self) -> Self {
        Self {
            directory: self.directory.or(other.directory),
            duration: self.duration.or(other.duration),
            content_type: self.content_type.or(other.content_type),
            concurrency: self.concurrency.or(other.concurrency),
            hash_length: self.hash_length.or(other.hash_length),
            verbose: self.verbose.or(other.verbose),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub source: String,
    pub service_config: Config,
    pub fetch_options: FetchOptions,
    pub output_format: OutputFormat,
}

impl Settings {
    pub fn get() -> Result<Self> {
        let cli = Cli::parse();

        let mut service_config = Config::get(cli.config.as_deref())?;
        service_config.logging.format = LogFormat::Auto;

        let global_config_file = match find_global_config_file() {
            Some(path) => ConfigFile::parse(&path)?,
            None => ConfigFile::default(),
        };
        let config_file = match find_project_config_file() {
            Some(path) => ConfigFile::parse(&path)?.or(global_config_file),
            None => global_config_file,
        };

        if let Some(directory) = config_file.directory {
            service_config.directory = directory;
        }
        if let Some(duration) = config_file.duration {
            service_config.duration = duration;
        }
        if let Some(content_type) = config_file.content_type {
            service_config.content_type = content_type;
        }
        if let Some(concurrency) = config_file.concurrency {
            service_config.concurrency = concurrency;
        }
        if let Some(hash_length) = config_file.hash_length {
            service_config.hash_length = hash_length;
        }
        if let Some(verbose) = config_file.verbose {
            service_config.verbose = verbose;
        }

        let verbose = cli.verbose || service_config.verbose;
        service_config.logging.level = effective_log_level(cli.log_level, verbose);

        let fetch_options = FetchOptions {
            content_type: cli.content_type,
            directory: cli.directory,
            duration: cli.duration,
            dry_run: cli.dry_run.then_some(true),
            remove_url_query_params: cli.remove_url_query_params.then_some(true),
            verbose: cli.verbose.then_some(true),
            return_type: cli.response.then_some(ReturnType::Response),
            ..Default::default()
        };

        Ok(Settings {
            source: cli.source,
            service_config,
            fetch_options,
            output_format: cli.format,
        })
    }
}

/// Progress lines are logged at `INFO` in verbose mode, so they must not be filtered out.
fn effective_log_level(requested: LevelFilter, verbose: bool) -> LevelFilter {
    match verbose {
        true => requested.max(LevelFilter::INFO),
        false => requested,
    }
}

fn find_global_config_file() -> Option<PathBuf> {
    dirs::home_dir().map(|mut path| {
        path.push(CONFIG_RC_FILE_NAME);
        path
    })
}

fn find_project_config_file() -> Option<PathBuf> {
    std::env::current_dir().ok().and_then(|mut path| {
        loop {
            path.push(CONFIG_RC_FILE_NAME);
            if path.exists() {
                return Some(path);
            }
            path.pop();
            if !path.pop() {
                return None;
            }
        }
    })
}
