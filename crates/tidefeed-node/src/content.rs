//! Content-addressed blob storage.
//!
//! The sync engine treats the content store as an opaque collaborator:
//! bytes go in under their BLAKE3 id, and pins are durable requests that a
//! given id be retained on this device.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::fs;
use tracing::{debug, info};

use tidefeed_shared::types::ContentId;

use crate::error::{NodeError, Result};

pub trait ContentStore: Send + Sync + 'static {
    fn put(&self, bytes: Vec<u8>) -> impl Future<Output = Result<ContentId>> + Send;

    fn get(&self, id: &ContentId) -> impl Future<Output = Result<Vec<u8>>> + Send;

    fn pin(&self, id: &ContentId) -> impl Future<Output = Result<()>> + Send;

    fn unpin(&self, id: &ContentId) -> impl Future<Output = Result<()>> + Send;

    fn list_pinned(&self) -> impl Future<Output = Result<Vec<ContentId>>> + Send;
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, name: &str) -> Result<PathBuf> {
    let mut resolved = base.to_path_buf();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            _ => {
                return Err(NodeError::Content(format!("invalid content id: {name}")));
            }
        }
    }
    if resolved == base || !resolved.starts_with(base) || resolved.parent() != Some(base) {
        return Err(NodeError::Content(format!("invalid content id: {name}")));
    }
    Ok(resolved)
}

/// Blobs live under `<base>/blobs/<content id>`; the pin set is persisted as
/// JSON in `<base>/pins.json`.
#[derive(Debug)]
pub struct FsContentStore {
    blobs: PathBuf,
    pins_path: PathBuf,
    max_size: usize,
    pins: tokio::sync::Mutex<BTreeSet<ContentId>>,
}

impl FsContentStore {
    pub async fn open(base_path: PathBuf, max_size: usize) -> Result<Self> {
        let blobs = base_path.join("blobs");
        fs::create_dir_all(&blobs).await?;

        let pins_path = base_path.join("pins.json");
        let pins = match fs::read(&pins_path).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };

        info!(path = %base_path.display(), "Content store initialized");

        Ok(Self {
            blobs,
            pins_path,
            max_size,
            pins: tokio::sync::Mutex::new(pins),
        })
    }

    fn blob_path(&self, id: &ContentId) -> Result<PathBuf> {
        ensure_within(&self.blobs, id.as_str())
    }

    async fn persist_pins(&self, pins: &BTreeSet<ContentId>) -> Result<()> {
        let tmp = self.pins_path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(pins)?).await?;
        fs::rename(&tmp, &self.pins_path).await?;
        Ok(())
    }
}

impl ContentStore for FsContentStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentId> {
        if bytes.len() > self.max_size {
            return Err(NodeError::ContentTooLarge {
                size: bytes.len(),
                max: self.max_size,
            });
        }

        let id = ContentId::for_bytes(&bytes);
        let path = self.blob_path(&id)?;
        if fs::try_exists(&path).await? {
            return Ok(id);
        }
        fs::write(&path, &bytes).await?;
        debug!(content = %id, size = bytes.len(), "Blob stored");
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>> {
        let path = self.blob_path(id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(NodeError::NotFound(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn pin(&self, id: &ContentId) -> Result<()> {
        self.blob_path(id)?;
        let mut pins = self.pins.lock().await;
        if pins.contains(id) {
            return Ok(());
        }
        // memory only follows a successful write
        let mut next = pins.clone();
        next.insert(id.clone());
        self.persist_pins(&next).await?;
        *pins = next;
        debug!(content = %id, "Pinned");
        Ok(())
    }

    async fn unpin(&self, id: &ContentId) -> Result<()> {
        let mut pins = self.pins.lock().await;
        if !pins.contains(id) {
            return Ok(());
        }
        let mut next = pins.clone();
        next.remove(id);
        self.persist_pins(&next).await?;
        *pins = next;
        debug!(content = %id, "Unpinned");
        Ok(())
    }

    async fn list_pinned(&self) -> Result<Vec<ContentId>> {
        Ok(self.pins.lock().await.iter().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryInner {
    blobs: HashMap<ContentId, Vec<u8>>,
    pins: BTreeSet<ContentId>,
}

/// Volatile store; clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryContentStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryInner) -> T) -> Result<T> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|e| NodeError::Content(format!("Lock poisoned: {e}")))?;
        Ok(f(&mut guard))
    }
}

impl ContentStore for MemoryContentStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentId> {
        let id = ContentId::for_bytes(&bytes);
        self.with(|inner| {
            inner.blobs.insert(id.clone(), bytes);
        })?;
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>> {
        self.with(|inner| inner.blobs.get(id).cloned())?
            .ok_or_else(|| NodeError::NotFound(id.clone()))
    }

    async fn pin(&self, id: &ContentId) -> Result<()> {
        self.with(|inner| {
            inner.pins.insert(id.clone());
        })
    }

    async fn unpin(&self, id: &ContentId) -> Result<()> {
        self.with(|inner| {
            inner.pins.remove(id);
        })
    }

    async fn list_pinned(&self) -> Result<Vec<ContentId>> {
        self.with(|inner| inner.pins.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_put_get_and_pins_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::open(dir.path().to_path_buf(), 1024).await.unwrap();

        let id = store.put(b"hello".to_vec()).await.unwrap();
        assert_eq!(id, ContentId::for_bytes(b"hello"));
        assert_eq!(store.get(&id).await.unwrap(), b"hello");
        // same bytes, same id
        assert_eq!(store.put(b"hello".to_vec()).await.unwrap(), id);

        store.pin(&id).await.unwrap();
        drop(store);

        let reopened = FsContentStore::open(dir.path().to_path_buf(), 1024).await.unwrap();
        assert_eq!(reopened.list_pinned().await.unwrap(), vec![id.clone()]);
        reopened.unpin(&id).await.unwrap();
        assert!(reopened.list_pinned().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fs_store_rejects_oversize_and_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::open(dir.path().to_path_buf(), 4).await.unwrap();

        assert!(matches!(
            store.put(vec![0u8; 5]).await,
            Err(NodeError::ContentTooLarge { size: 5, max: 4 })
        ));
        assert!(store.get(&ContentId::from("../escape")).await.is_err());
        assert!(store.pin(&ContentId::from("a/b")).await.is_err());
        assert!(matches!(
            store.get(&ContentId::from("missing")).await,
            Err(NodeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_pin_write_leaves_pin_set_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::open(dir.path().to_path_buf(), 1024).await.unwrap();
        let id = store.put(b"kept".to_vec()).await.unwrap();

        // a directory where the temp file goes makes the write fail
        let blocker = dir.path().join("pins.json.tmp");
        std::fs::create_dir(&blocker).unwrap();
        assert!(store.pin(&id).await.is_err());
        assert!(store.list_pinned().await.unwrap().is_empty());

        std::fs::remove_dir(&blocker).unwrap();
        store.pin(&id).await.unwrap();
        let reopened = FsContentStore::open(dir.path().to_path_buf(), 1024).await.unwrap();
        assert_eq!(reopened.list_pinned().await.unwrap(), vec![id.clone()]);

        std::fs::create_dir(&blocker).unwrap();
        assert!(reopened.unpin(&id).await.is_err());
        assert_eq!(reopened.list_pinned().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn memory_store_shares_state_between_clones() {
        let store = MemoryContentStore::new();
        let other = store.clone();
        let id = store.put(b"x".to_vec()).await.unwrap();
        other.pin(&id).await.unwrap();
        assert_eq!(store.list_pinned().await.unwrap(), vec![id.clone()]);
        assert_eq!(other.get(&id).await.unwrap(), b"x");
    }
}
