use std::path::Path;

use assetcache_service::config::Config;
use assetcache_service::service::AssetFetchService;
use assetcache_test as test;

pub use test::{HitCounter, TempDir};

/// Setup tests and create a test service.
///
/// This function returns a tuple containing the service to test, and a temporary cache
/// directory. The directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as
/// guard until the test has finished.
///
/// The `update_config` closure can modify any default configuration if needed before the service
/// is created.
pub fn setup_service(update_config: impl FnOnce(&mut Config)) -> (AssetFetchService, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();

    let mut config = Config {
        directory: cache_dir.path().to_owned(),
        ..Default::default()
    };
    update_config(&mut config);

    (AssetFetchService::new(config), cache_dir)
}

/// The names of all files in the cache directory, sorted.
pub fn cache_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return vec![];
    };
    let mut names: Vec<_> = entries
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
