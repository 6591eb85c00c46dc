use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::types::{ContentType, Contents};

use super::fs::{CacheFs, catch_not_found, remove_if_exists, write_file_atomically};
use super::metadata::{Metadata, StoredRecord, decode_record, encode_record};
use super::CacheError;

/// The on-disk store of a single cache entry.
///
/// An entry is a metadata file at `<directory>/<filename>` plus a content file next to it,
/// suffixed with the storage type. Changes are staged in memory by [`set`](Self::set) and only
/// written by [`save`](Self::save).
#[derive(Debug)]
pub struct FileCache {
    directory: PathBuf,
    fs_path: PathBuf,
    dry_run: bool,
    fs: CacheFs,
    state: Mutex<EntryState>,
}

#[derive(Debug, Default)]
struct EntryState {
    record: Option<StoredRecord>,
    contents: Option<Contents>,
    pending: bool,
}

impl FileCache {
    pub fn new(directory: impl Into<PathBuf>, filename: &str, dry_run: bool, fs: CacheFs) -> Self {
        let directory = directory.into();
        let fs_path = directory.join(filename);
        Self {
            directory,
            fs_path,
            dry_run,
            fs,
            state: Mutex::default(),
        }
    }

    /// The path of the metadata file.
    pub fn fs_path(&self) -> &Path {
        &self.fs_path
    }

    /// The path of the content file for contents stored as `ty`.
    pub fn contents_path(&self, ty: ContentType) -> PathBuf {
        let mut path = self.fs_path.clone().into_os_string();
        path.push(".");
        path.push(ty.suffix());
        path.into()
    }

    /// Returns the metadata of this entry, loading it from disk on first access.
    ///
    /// Returns `None` if there is no entry yet.
    pub async fn get(&self) -> Result<Option<Metadata>, CacheError> {
        if let Some(record) = &self.state.lock().record {
            return Ok(Some(record.metadata.clone()));
        }

        if !self.fs.exists.exists(&self.fs_path).await {
            return Ok(None);
        }

        let Some(bytes) = catch_not_found(tokio::fs::read(&self.fs_path).await)? else {
            self.fs.exists.set(&self.fs_path, false);
            return Ok(None);
        };
        let record = decode_record(&bytes)?;

        let mut state = self.state.lock();
        // a concurrent `set` wins over what was on disk
        let record = state.record.get_or_insert(record);
        Ok(Some(record.metadata.clone()))
    }

    /// Stages new contents in memory, to be written by the next [`save`](Self::save).
    pub fn set(&self, content_type: ContentType, contents: Contents, metadata: Map<String, Value>) {
        let mut state = self.state.lock();
        state.record = Some(StoredRecord {
            metadata: Metadata::new(content_type, metadata),
            embedded: None,
        });
        state.contents = Some(contents);
        state.pending = true;
    }

    /// Writes staged changes to disk.
    ///
    /// This is a no-op in dry-run mode or when nothing was staged. The content file is persisted
    /// before the metadata file that refers to it.
    pub async fn save(&self) -> Result<(), CacheError> {
        if self.dry_run {
            return Ok(());
        }

        let (metadata, contents) = {
            let state = self.state.lock();
            if !state.pending {
                return Ok(());
            }
            match (&state.record, &state.contents) {
                (Some(record), Some(contents)) => (record.metadata.clone(), contents.clone()),
                _ => return Ok(()),
            }
        };

        self.fs.directories.ensure(&self.directory).await?;

        let contents_path = self.contents_path(metadata.content_type);
        let bytes = contents.to_file_bytes()?;
        metric!(time_raw("caches.file.size") = bytes.len() as u64);
        write_file_atomically(contents_path.clone(), bytes).await?;
        self.fs.exists.set(&contents_path, true);

        write_file_atomically(self.fs_path.clone(), encode_record(&metadata)?).await?;
        self.fs.exists.set(&self.fs_path, true);

        metric!(counter("caches.file.write") += 1);
        tracing::trace!(path = %self.fs_path.display(), "Wrote cache entry");

        let mut state = self.state.lock();
        let unchanged = state
            .record
            .as_ref()
            .is_some_and(|r| r.metadata.cached_at == metadata.cached_at);
        if unchanged {
            state.pending = false;
        }
        Ok(())
    }

    /// Whether the contents of this entry are available, either in memory, inlined into a legacy
    /// record, or as a content file.
    pub async fn has_contents(&self, ty: ContentType) -> bool {
        {
            let state = self.state.lock();
            if state.contents.is_some() {
                return true;
            }
            if state.record.as_ref().is_some_and(|r| r.embedded.is_some()) {
                return true;
            }
        }
        self.fs.exists.exists(&self.contents_path(ty)).await
    }

    /// Whether the file holding the contents of this entry is actually on disk.
    ///
    /// Unlike [`has_contents`](Self::has_contents) this always stats the file, and records the
    /// outcome in the shared existence probe. Contents inlined into a legacy record live in the
    /// metadata file itself.
    pub async fn contents_on_disk(&self, ty: ContentType) -> bool {
        let embedded = {
            let state = self.state.lock();
            state.record.as_ref().is_some_and(|r| r.embedded.is_some())
        };
        let path = match embedded {
            true => self.fs_path.clone(),
            false => self.contents_path(ty),
        };

        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        self.fs.exists.set(&path, exists);
        if !exists && !tokio::fs::try_exists(&self.directory).await.unwrap_or(false) {
            self.fs.exists.set(&self.fs_path, false);
            self.fs.directories.forget(&self.directory).await;
        }
        exists
    }

    /// Returns the contents of this entry, loading them on first access.
    ///
    /// Returns `None` if there is no entry or its content file has gone missing.
    pub async fn get_contents(&self) -> Result<Option<Contents>, CacheError> {
        let Some(metadata) = self.get().await? else {
            return Ok(None);
        };

        let embedded = {
            let state = self.state.lock();
            if let Some(contents) = &state.contents {
                return Ok(Some(contents.clone()));
            }
            state.record.as_ref().and_then(|r| r.embedded.clone())
        };

        let contents = match embedded {
            Some(value) => Contents::from_embedded(metadata.content_type, value)?,
            None => {
                let path = self.contents_path(metadata.content_type);
                let Some(bytes) = catch_not_found(tokio::fs::read(&path).await)? else {
                    self.fs.exists.set(&path, false);
                    return Ok(None);
                };
                Contents::from_file_bytes(metadata.content_type, bytes)?
            }
        };

        self.state.lock().contents = Some(contents.clone());
        Ok(Some(contents))
    }

    /// Whether any file of this entry exists on disk.
    pub async fn has_files(&self) -> bool {
        for path in self.all_paths() {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }

    /// Deletes the metadata file and every content file of this entry.
    ///
    /// Missing files are not an error.
    pub async fn destroy(&self) -> Result<(), CacheError> {
        for path in self.all_paths() {
            remove_if_exists(&path).await?;
            self.fs.exists.set(&path, false);
        }
        *self.state.lock() = EntryState::default();
        Ok(())
    }

    fn all_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.fs_path.clone()];
        paths.extend(ContentType::STORED.iter().map(|ty| self.contents_path(*ty)));
        paths
    }
}
