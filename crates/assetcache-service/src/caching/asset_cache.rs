use std::path::Path;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::config::FetchSettings;
use crate::types::{ContentType, Contents};

use super::duration::CacheDuration;
use super::file_cache::FileCache;
use super::fs::CacheFs;
use super::metadata::Metadata;
use super::{CacheError, CacheKey};

/// Characters that are not allowed in filenames on at least one major platform.
const ILLEGAL_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// A typed, persistent cache entry for one [`CacheKey`].
#[derive(Debug)]
pub struct AssetCache {
    key: CacheKey,
    hash: String,
    filename: String,
    file: FileCache,
}

impl AssetCache {
    /// Creates the entry handle for `key`.
    ///
    /// The filename is `assetcache-<hash>`, unless a filename formatter is configured. Its output
    /// is stripped of characters that are illegal in paths, and must not end up empty.
    pub fn new(key: CacheKey, settings: &FetchSettings, fs: CacheFs) -> Result<Self, CacheError> {
        let hash = key.hash_hex(settings.hash_length);
        let filename = match &settings.filename_format {
            Some(format) => sanitize_filename(&format(&key.uid(), &hash))?,
            None => format!("assetcache-{hash}"),
        };
        let file = FileCache::new(&settings.directory, &filename, settings.dry_run, fs);

        Ok(Self {
            key,
            hash,
            filename,
            file,
        })
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The truncated hash of the key.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The path of the metadata file.
    pub fn cache_path(&self) -> &Path {
        self.file.fs_path()
    }

    /// The stored metadata, if this entry exists.
    pub async fn cached_record(&self) -> Result<Option<Metadata>, CacheError> {
        self.file.get().await
    }

    /// Whether the entry exists, is fresh according to `duration`, and still has its contents.
    ///
    /// Without a `duration` any existing entry is fresh.
    pub async fn is_cache_valid(&self, duration: Option<CacheDuration>) -> Result<bool, CacheError> {
        let Some(metadata) = self.file.get().await? else {
            return Ok(false);
        };

        let fresh = duration.is_none_or(|d| d.is_fresh(metadata.cached_at, Utc::now()));
        if !fresh {
            tracing::trace!(key = %self.key.uid(), cached_at = %metadata.cached_at, "Cache entry expired");
            return Ok(false);
        }

        let on_disk = self.file.contents_on_disk(metadata.content_type).await;
        if !on_disk {
            tracing::trace!(key = %self.key.uid(), "Cache entry lost its contents");
        }
        Ok(on_disk)
    }

    /// The stored contents, if any.
    pub async fn get_cached_value(&self) -> Result<Option<Contents>, CacheError> {
        self.file.get_contents().await
    }

    /// Stores `contents` as the new value of this entry.
    ///
    /// Empty contents are rejected. The `requested` type is kept when it can represent the
    /// contents, see [`Contents::storage_type`].
    pub async fn save(
        &self,
        contents: Contents,
        requested: ContentType,
        metadata: Map<String, Value>,
    ) -> Result<(), CacheError> {
        if contents.is_empty() {
            return Err(CacheError::EmptyContents(self.key.uid()));
        }

        let content_type = contents.storage_type(requested);
        self.file.set(content_type, contents, metadata);
        self.file.save().await
    }

    /// Whether any file belonging to this entry exists.
    pub async fn has_cache_files(&self) -> bool {
        self.file.has_files().await
    }

    /// Deletes all files of this entry.
    pub async fn destroy(&self) -> Result<(), CacheError> {
        self.file.destroy().await
    }
}

fn sanitize_filename(raw: &str) -> Result<String, CacheError> {
    let filename: String = raw
        .chars()
        .filter(|c| !c.is_control() && !ILLEGAL_FILENAME_CHARS.contains(c))
        .collect();
    let filename = filename.trim();

    if filename.is_empty() || filename == "." || filename == ".." {
        return Err(CacheError::InvalidFilename(raw.to_owned()));
    }
    Ok(filename.to_owned())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b:c*d").unwrap(), "abcd");
        assert_eq!(sanitize_filename("feed\n.json").unwrap(), "feed.json");
        assert!(matches!(
            sanitize_filename("<>:\"/\\|?*"),
            Err(CacheError::InvalidFilename(_))
        ));
        assert!(sanitize_filename("..").is_err());
    }

    #[test]
    fn test_filename_format() {
        let mut settings = FetchSettings::default();
        settings.filename_format = Some(Arc::new(|uid: &str, hash: &str| {
            format!("{}-{hash}", uid.rsplit('/').next().unwrap_or_default())
        }));
        settings.hash_length = 8;

        let key = CacheKey::builder("https://example.com/feed.xml")
            .build()
            .unwrap();
        let cache = AssetCache::new(key.clone(), &settings, CacheFs::default()).unwrap();
        assert_eq!(cache.filename(), format!("feed.xml-{}", key.hash_hex(8)));

        settings.filename_format = Some(Arc::new(|_: &str, _: &str| "///".to_owned()));
        assert!(matches!(
            AssetCache::new(key, &settings, CacheFs::default()),
            Err(CacheError::InvalidFilename(_))
        ));
    }

    #[test]
    fn test_default_filename() {
        let settings = FetchSettings::default();
        let key = CacheKey::builder("https://example.com/").build().unwrap();
        let cache = AssetCache::new(key.clone(), &settings, CacheFs::default()).unwrap();

        assert_eq!(cache.hash().len(), 30);
        assert_eq!(cache.filename(), format!("assetcache-{}", key.hash_hex(30)));
        assert_eq!(
            cache.cache_path(),
            Path::new(".cache").join(cache.filename())
        );
    }

    #[tokio::test]
    async fn test_lost_contents_are_noticed() {
        let tempdir = tempfile::tempdir().unwrap();
        let settings = FetchSettings {
            directory: tempdir.path().join("c"),
            ..FetchSettings::default()
        };
        let fs = CacheFs::default();
        let key = || CacheKey::builder("c").build().unwrap();
        let one_day = Some(CacheDuration::DEFAULT);

        let cache = AssetCache::new(key(), &settings, fs.clone()).unwrap();
        cache
            .save(Contents::from("c"), ContentType::Text, Map::new())
            .await
            .unwrap();
        assert!(cache.is_cache_valid(one_day).await.unwrap());

        // another entry sharing the same bookkeeping sees the content file vanish
        let content_path = cache.file.contents_path(ContentType::Text);
        std::fs::remove_file(&content_path).unwrap();
        let other = AssetCache::new(key(), &settings, fs.clone()).unwrap();
        assert!(other.cached_record().await.unwrap().is_some());
        assert!(!other.is_cache_valid(one_day).await.unwrap());
        assert!(!fs.exists.exists(&content_path).await);

        // the contents are still held in memory, but the directory is gone
        cache
            .save(Contents::from("c"), ContentType::Text, Map::new())
            .await
            .unwrap();
        std::fs::remove_dir_all(&settings.directory).unwrap();
        assert!(!cache.is_cache_valid(one_day).await.unwrap());
        assert!(!fs.directories.is_created(&settings.directory).await);

        // and saving creates it again
        cache
            .save(Contents::from("c"), ContentType::Text, Map::new())
            .await
            .unwrap();
        assert!(cache.is_cache_valid(one_day).await.unwrap());
    }
}
