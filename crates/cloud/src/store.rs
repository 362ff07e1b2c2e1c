//! Persisted cluster registry.
//!
//! Providers whose infrastructure has no authoritative listing API (the
//! local kind runtime, adopted custom clusters) record their clusters here.
//! The backing store is swappable: [`FileClusterStore`] for real runs,
//! [`MemoryClusterStore`] for tests.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use async_trait::async_trait;
use fs2::FileExt;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use crate::providers::{Cluster, ProviderError};

/// Cluster records keyed by cluster id.
pub type ClusterMap = BTreeMap<String, Cluster>;

/// A read-modify-write transaction over the whole map.
pub type Transaction<'a> =
    Box<dyn FnOnce(&mut ClusterMap) -> Result<(), ProviderError> + Send + 'a>;

/// Storage for cluster records.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Read every record. An absent store is empty, not an error.
    async fn load(&self) -> Result<ClusterMap, ProviderError>;

    /// Replace every record.
    async fn save(&self, clusters: &ClusterMap) -> Result<(), ProviderError>;

    /// Load, apply `tx`, and save under one exclusive lock.
    ///
    /// Nothing is written when `tx` fails.
    async fn update<'a>(&self, tx: Transaction<'a>) -> Result<(), ProviderError>;
}

/// Run a transaction that produces a value.
///
/// # Errors
///
/// Returns the transaction's error, or the store's load/save error.
pub async fn update_with<T, F>(store: &dyn ClusterStore, f: F) -> Result<T, ProviderError>
where
    T: Send,
    F: FnOnce(&mut ClusterMap) -> Result<T, ProviderError> + Send,
{
    let mut result = None;
    store
        .update(Box::new(|clusters| {
            result = Some(f(clusters)?);
            Ok(())
        }))
        .await?;
    result.ok_or_else(|| ProviderError::Store("transaction did not run".to_string()))
}

/// Default location of the local cluster store.
#[must_use]
pub fn default_store_path() -> PathBuf {
    std::env::temp_dir().join("adhar").join("clusters.json")
}

/// One lock per store file, shared by every store instance in the process.
static FILE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn lock_for(path: &Path) -> Arc<RwLock<()>> {
    let mut locks = FILE_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    locks
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(RwLock::new(())))
        .clone()
}

/// Resolve symlinks in the parent directory so aliases share one lock.
///
/// Falls back to the absolute path while the directory does not exist yet.
fn canonical_store_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map_or_else(|_| absolute.clone(), |dir| dir.join(name)),
        _ => absolute,
    }
}

/// JSON file store.
///
/// Every operation holds an advisory lock on a sibling `.lock` file, shared
/// for reads and exclusive for writes, so separate CLI processes serialise
/// their transactions. Writes go to a unique temp file that is renamed into
/// place, so readers never observe a half-written document.
#[derive(Clone)]
pub struct FileClusterStore {
    path: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl FileClusterStore {
    /// Open the store at `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = canonical_store_path(&path.into());
        let lock = lock_for(&path);
        Self { path, lock }
    }

    /// Open the store at [`default_store_path`].
    #[must_use]
    pub fn at_default_path() -> Self {
        Self::new(default_store_path())
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }

    /// Take the cross-process lock. Released when the returned file drops.
    async fn lock_file(&self, exclusive: bool) -> Result<std::fs::File, ProviderError> {
        let path = self.lock_path();
        let display = path.display().to_string();
        let locked = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            if exclusive {
                FileExt::lock_exclusive(&file)?;
            } else {
                FileExt::lock_shared(&file)?;
            }
            Ok(file)
        })
        .await
        .map_err(|e| ProviderError::Store(format!("lock task for {display} failed: {e}")))?;

        locked.map_err(|e| ProviderError::Store(format!("failed to lock {display}: {e}")))
    }

    async fn read_file(&self) -> Result<ClusterMap, ProviderError> {
        match fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(ClusterMap::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                ProviderError::Store(format!(
                    "corrupt cluster store {}: {e}",
                    self.path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClusterMap::new()),
            Err(e) => Err(ProviderError::Store(format!(
                "failed to read cluster store {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn write_file(&self, clusters: &ClusterMap) -> Result<(), ProviderError> {
        let content = serde_json::to_string_pretty(clusters)?;
        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(parent)?;
            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| ProviderError::Store(format!("write task failed: {e}")))?;

        written.map_err(|e| {
            ProviderError::Store(format!(
                "failed to replace cluster store {}: {e}",
                self.path.display()
            ))
        })?;

        debug!(path = %self.path.display(), clusters = clusters.len(), "Saved cluster store");
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for FileClusterStore {
    async fn load(&self) -> Result<ClusterMap, ProviderError> {
        let _guard = self.lock.read().await;
        let _file = self.lock_file(false).await?;
        self.read_file().await
    }

    async fn save(&self, clusters: &ClusterMap) -> Result<(), ProviderError> {
        let _guard = self.lock.write().await;
        let _file = self.lock_file(true).await?;
        self.write_file(clusters).await
    }

    async fn update<'a>(&self, tx: Transaction<'a>) -> Result<(), ProviderError> {
        let _guard = self.lock.write().await;
        let _file = self.lock_file(true).await?;
        let mut clusters = self.read_file().await?;
        tx(&mut clusters)?;
        self.write_file(&clusters).await
    }
}

/// In-memory store.
#[derive(Default, Clone)]
pub struct MemoryClusterStore {
    clusters: Arc<RwLock<ClusterMap>>,
}

impl MemoryClusterStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn load(&self) -> Result<ClusterMap, ProviderError> {
        Ok(self.clusters.read().await.clone())
    }

    async fn save(&self, clusters: &ClusterMap) -> Result<(), ProviderError> {
        *self.clusters.write().await = clusters.clone();
        Ok(())
    }

    async fn update<'a>(&self, tx: Transaction<'a>) -> Result<(), ProviderError> {
        let mut guard = self.clusters.write().await;
        let mut working = guard.clone();
        tx(&mut working)?;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ClusterSpec;
    use tempfile::TempDir;

    fn cluster(name: &str) -> Cluster {
        Cluster::new("kind", &ClusterSpec::new("kind", name))
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileClusterStore::new(dir.path().join("clusters.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clusters.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileClusterStore::new(&path);

        assert!(matches!(store.load().await, Err(ProviderError::Store(_))));
        let err = store.update(Box::new(|_| Ok(()))).await.unwrap_err();
        assert!(matches!(err, ProviderError::Store(_)));
        // The corrupt document is left untouched
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[tokio::test]
    async fn test_failed_transaction_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = FileClusterStore::new(dir.path().join("clusters.json"));
        let c = cluster("a");
        store
            .update(Box::new(move |m| {
                m.insert(c.id.clone(), c);
                Ok(())
            }))
            .await
            .unwrap();

        let err = store
            .update(Box::new(|m| {
                m.clear();
                Err(ProviderError::NotFound("kind-b".into()))
            }))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_lose_nothing() {
        const WRITERS: usize = 32;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clusters.json");

        let mut handles = Vec::new();
        for i in 0..WRITERS {
            // Separate instances share the per-path lock
            let store = FileClusterStore::new(&path);
            handles.push(tokio::spawn(async move {
                let c = cluster(&format!("c{i}"));
                store
                    .update(Box::new(move |m| {
                        m.insert(c.id.clone(), c);
                        Ok(())
                    }))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let clusters = FileClusterStore::new(&path).load().await.unwrap();
        assert_eq!(clusters.len(), WRITERS);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_symlinked_alias_shares_the_lock() {
        const WRITERS: usize = 64;
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real");
        let link = dir.path().join("link");
        std::fs::create_dir(&real).unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let mut handles = Vec::new();
        for i in 0..WRITERS {
            let base = if i % 2 == 0 { &real } else { &link };
            let store = FileClusterStore::new(base.join("clusters.json"));
            handles.push(tokio::spawn(async move {
                let c = cluster(&format!("c{i}"));
                store
                    .update(Box::new(move |m| {
                        m.insert(c.id.clone(), c);
                        Ok(())
                    }))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let via_link = FileClusterStore::new(link.join("clusters.json"));
        assert_eq!(via_link.path(), FileClusterStore::new(real.join("clusters.json")).path());
        assert_eq!(via_link.load().await.unwrap().len(), WRITERS);
    }

    #[tokio::test]
    async fn test_writes_leave_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FileClusterStore::new(dir.path().join("clusters.json"));
        let c = cluster("a");
        store
            .update(Box::new(move |m| {
                m.insert(c.id.clone(), c);
                Ok(())
            }))
            .await
            .unwrap();

        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, ["clusters.json", "clusters.json.lock"]);
    }

    #[tokio::test]
    async fn test_update_with_returns_value() {
        let store = MemoryClusterStore::new();
        let c = cluster("x");
        let id = update_with(&store, move |m| {
            let id = c.id.clone();
            m.insert(id.clone(), c);
            Ok(id)
        })
        .await
        .unwrap();
        assert_eq!(id, "kind-x");
        assert!(store.load().await.unwrap().contains_key("kind-x"));
    }
}
