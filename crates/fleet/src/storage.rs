//! Environment object storage.
//!
//! The bootstrap record and environment-local metadata indexes live in
//! a key/value store with put/get semantics. [`MemoryStorage`] backs tests
//! and the local backend; [`FileStorage`] keeps objects in a directory.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Suffix of in-flight writes; never listed as objects.
const TEMP_SUFFIX: &str = ".fleet-tmp";

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No object under this name.
    #[error("object not found: {0}")]
    NotFound(String),

    /// A conditional write found an existing object.
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// Object name is empty or escapes the storage root.
    #[error("invalid object name: {0:?}")]
    InvalidName(String),

    /// Filesystem failure.
    #[error("I/O error on {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Object storage for one environment.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read an object.
    async fn get(&self, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Write an object, replacing any existing value.
    async fn put(&self, name: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Write an object only if none exists under `name`.
    ///
    /// Fails with [`StorageError::AlreadyExists`] otherwise. Implementations
    /// must make the check and the write atomic.
    async fn put_if_absent(&self, name: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Remove an object. Removing a missing object succeeds.
    async fn remove(&self, name: &str) -> Result<(), StorageError>;

    /// List object names starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// URL under which the object is reachable.
    fn url(&self, name: &str) -> String;
}

fn check_name(name: &str) -> Result<(), StorageError> {
    let invalid = name.is_empty()
        || Path::new(name)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if invalid {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// In-memory storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    bucket: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty store named after its bucket.
    #[must_use]
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // A poisoned map is still consistent: every mutation is a single call.
        self.objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        check_name(name)?;
        self.objects()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        check_name(name)?;
        self.objects().insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn put_if_absent(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        check_name(name)?;
        let mut objects = self.objects();
        if objects.contains_key(name) {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        objects.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        check_name(name)?;
        self.objects().remove(name);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .objects()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn url(&self, name: &str) -> String {
        format!("mem://{}/{name}", self.bucket)
    }
}

/// Storage rooted in a local directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Create storage rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, name: &str) -> Result<PathBuf, StorageError> {
        check_name(name)?;
        Ok(self.root.join(name))
    }

    async fn ensure_parent(&self, path: &Path, name: &str) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|source| io(name, source))?;
        }
        Ok(())
    }

    /// Write `data` to a fresh file beside `path` and flush it to disk.
    async fn write_temp(
        path: &Path,
        name: &str,
        data: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let unique = Uuid::new_v4().simple();
        let tmp = path.with_file_name(format!(".{file_name}.{unique}{TEMP_SUFFIX}"));

        let written = async {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)
                .await?;
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await;
        match written {
            Ok(()) => Ok(tmp),
            Err(source) => {
                discard(&tmp).await;
                Err(io(name, source))
            }
        }
    }

    async fn walk(&self, dir: PathBuf, out: &mut Vec<String>) -> Result<(), StorageError> {
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(io(&dir.to_string_lossy(), source)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|source| io(&dir.to_string_lossy(), source))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|source| io(&path.to_string_lossy(), source))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if path.to_string_lossy().ends_with(TEMP_SUFFIX) {
                    continue;
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let name = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    out.push(name);
                }
            }
        }
        Ok(())
    }
}

async fn discard(tmp: &Path) {
    if let Err(e) = fs::remove_file(tmp).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %tmp.display(), error = %e, "Failed to remove temporary file");
        }
    }
}

fn io(name: &str, source: std::io::Error) -> StorageError {
    StorageError::Io {
        name: name.to_string(),
        source,
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(source) => Err(io(name, source)),
        }
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path(name)?;
        self.ensure_parent(&path, name).await?;

        // Readers see either the old object or the new one.
        let tmp = Self::write_temp(&path, name, data).await?;
        if let Err(source) = fs::rename(&tmp, &path).await {
            discard(&tmp).await;
            return Err(io(name, source));
        }
        debug!(name, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn put_if_absent(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path(name)?;
        self.ensure_parent(&path, name).await?;

        // The object only appears once fully written: linking fails if
        // the name is taken and never replaces an existing object.
        let tmp = Self::write_temp(&path, name, data).await?;
        let linked = fs::hard_link(&tmp, &path).await;
        discard(&tmp).await;
        match linked {
            Ok(()) => {
                debug!(name, bytes = data.len(), "Created object");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(name.to_string()))
            }
            Err(source) => Err(io(name, source)),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(io(name, source)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        self.walk(self.root.clone(), &mut names).await?;
        names.retain(|n| n.starts_with(prefix));
        names.sort();
        Ok(names)
    }

    fn url(&self, name: &str) -> String {
        format!("file://{}/{name}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(storage: &dyn Storage) {
        assert!(matches!(
            storage.get("a/b").await,
            Err(StorageError::NotFound(_))
        ));

        storage.put("a/b", b"one").await.unwrap();
        assert_eq!(storage.get("a/b").await.unwrap(), b"one");

        storage.put("a/b", b"two").await.unwrap();
        assert_eq!(storage.get("a/b").await.unwrap(), b"two");

        assert!(matches!(
            storage.put_if_absent("a/b", b"three").await,
            Err(StorageError::AlreadyExists(_))
        ));
        storage.put_if_absent("a/c", b"four").await.unwrap();
        storage.put("z", b"five").await.unwrap();

        assert_eq!(storage.list("a/").await.unwrap(), vec!["a/b", "a/c"]);

        storage.remove("a/b").await.unwrap();
        storage.remove("a/b").await.unwrap();
        assert!(matches!(
            storage.get("a/b").await,
            Err(StorageError::NotFound(_))
        ));

        assert!(matches!(
            storage.get("../escape").await,
            Err(StorageError::InvalidName(_))
        ));
        assert!(matches!(
            storage.put("", b"").await,
            Err(StorageError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new("test-bucket");
        exercise(&storage).await;
        assert_eq!(storage.url("tools/"), "mem://test-bucket/tools/");
    }

    #[tokio::test]
    async fn test_file_storage_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.put_if_absent("state.yaml", b"first").await.unwrap();
        assert!(matches!(
            storage.put_if_absent("state.yaml", b"second").await,
            Err(StorageError::AlreadyExists(_))
        ));
        storage.put("state.json", b"other").await.unwrap();

        assert_eq!(storage.get("state.yaml").await.unwrap(), b"first");
        let mut files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(files, vec!["state.json", "state.yaml"]);
    }

    #[tokio::test]
    async fn test_file_storage_concurrent_writes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        let puts = (0..8u8).map(|i| {
            let storage = storage.clone();
            async move { storage.put("shared", &[i]).await }
        });
        for result in spawn_all(puts).await {
            result.unwrap();
        }
        assert_eq!(storage.get("shared").await.unwrap().len(), 1);

        let creates = (0..8u8).map(|i| {
            let storage = storage.clone();
            async move { storage.put_if_absent("once", &[i]).await }
        });
        let results = spawn_all(creates).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, StorageError::AlreadyExists(_))));
        assert_eq!(storage.list("").await.unwrap(), vec!["once", "shared"]);
    }

    async fn spawn_all<F, T>(futs: impl Iterator<Item = F>) -> Vec<T>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = futs.map(tokio::spawn).collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("env"));
        exercise(&storage).await;
        assert!(storage.url("x").starts_with("file://"));
    }
}
