use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tempfile::NamedTempFile;

/// Creates cache directories, each at most once per owning context.
///
/// Membership in the set of known directories is what makes repeated calls a no-op, the
/// filesystem is not consulted again.
#[derive(Debug, Default)]
pub struct DirectoryManager {
    // A tokio mutex, as it is held while the directory is being created.
    created: tokio::sync::Mutex<HashSet<PathBuf>>,
    creations: AtomicUsize,
}

impl DirectoryManager {
    /// Makes sure `dir` exists, creating it and its parents if needed.
    ///
    /// Concurrent calls for the same path wait for the first one. A failed creation is not
    /// remembered, so the next call tries again.
    pub async fn ensure(&self, dir: &Path) -> io::Result<()> {
        let mut created = self.created.lock().await;
        if created.contains(dir) {
            return Ok(());
        }

        tracing::debug!(dir = %dir.display(), "Creating directory");
        self.creations.fetch_add(1, Ordering::Relaxed);
        tokio::fs::create_dir_all(dir).await?;
        created.insert(dir.to_owned());
        Ok(())
    }

    /// Forgets that `dir` was created, so the next [`ensure`](Self::ensure) creates it again.
    ///
    /// Used once a directory is found to be missing after all.
    pub async fn forget(&self, dir: &Path) {
        if self.created.lock().await.remove(dir) {
            tracing::debug!(dir = %dir.display(), "Directory disappeared");
        }
    }

    /// Whether `dir` was already created through this manager.
    pub async fn is_created(&self, dir: &Path) -> bool {
        self.created.lock().await.contains(dir)
    }

    /// The number of create operations issued so far.
    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::Relaxed)
    }
}

/// Remembers whether paths exist.
///
/// This is purely a performance cache. Anything that changes a path through this context has to
/// report the new state via [`set`](Self::set). Changes made by other processes are not noticed.
#[derive(Debug, Default)]
pub struct ExistenceProbe {
    checks: Mutex<HashMap<PathBuf, bool>>,
    lookups: AtomicUsize,
}

impl ExistenceProbe {
    /// Whether `path` exists, stat-ing it only the first time it is asked about.
    ///
    /// Paths that can not be stat-ed count as missing.
    pub async fn exists(&self, path: &Path) -> bool {
        if let Some(exists) = self.checks.lock().get(path) {
            return *exists;
        }

        self.lookups.fetch_add(1, Ordering::Relaxed);
        let exists = tokio::fs::try_exists(path).await.unwrap_or(false);
        self.checks.lock().insert(path.to_owned(), exists);
        exists
    }

    /// Records the known state of `path`.
    pub fn set(&self, path: &Path, exists: bool) {
        self.checks.lock().insert(path.to_owned(), exists);
    }

    /// The number of actual filesystem lookups so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

/// The filesystem bookkeeping shared by all caches of one context.
#[derive(Debug, Clone, Default)]
pub struct CacheFs {
    pub directories: Arc<DirectoryManager>,
    pub exists: Arc<ExistenceProbe>,
}

/// Writes `contents` to `path` through a temporary sibling file.
///
/// Readers either see the previous file or the complete new one.
pub async fn write_file_atomically(path: PathBuf, contents: Vec<u8>) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp_file = NamedTempFile::new_in(parent)?;
        temp_file.write_all(&contents)?;
        temp_file.flush()?;
        temp_file.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(io::Error::other)?
}

/// Removes a file, treating a missing file as success.
///
/// Returns whether a file was actually removed.
pub async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    Ok(catch_not_found(tokio::fs::remove_file(path).await)?.is_some())
}

pub(super) fn catch_not_found<R>(result: io::Result<R>) -> io::Result<Option<R>> {
    match result {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
