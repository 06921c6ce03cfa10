//! CAR file-backed block storage

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use cid::Cid as IpldCid;

use crate::codec::compute_cid;
use crate::error::{RepoError, Result};
use crate::storage::BlockStore;

/// CAR file-backed block storage
///
/// Loads the entire CAR file into memory on construction and writes it back
/// on [`flush`](Self::flush). The header roots hold the current commit CID.
///
/// Primarily useful for tests and simple single-process persistence; large
/// repositories want a database-backed store.
#[derive(Debug, Clone)]
pub struct FileBlockStore {
    path: PathBuf,
    blocks: Arc<RwLock<BTreeMap<IpldCid, Bytes>>>,
    roots: Arc<RwLock<Vec<IpldCid>>>,
    dirty: Arc<AtomicBool>,
}

impl FileBlockStore {
    /// Load from existing CAR file
    ///
    /// Every block is checked against its CID while loading.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let parsed = crate::car::read_car(&path).await?;
        for (cid, data) in &parsed.blocks {
            crate::codec::verify_block(cid, data)?;
        }

        Ok(Self {
            path,
            blocks: Arc::new(RwLock::new(parsed.blocks.into_iter().collect())),
            roots: Arc::new(RwLock::new(parsed.roots)),
            dirty: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create new CAR file storage (empty)
    ///
    /// The file is not created until the first flush.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            blocks: Arc::new(RwLock::new(BTreeMap::new())),
            roots: Arc::new(RwLock::new(Vec::new())),
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get the CAR file roots
    pub fn roots(&self) -> Vec<IpldCid> {
        self.roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Set the CAR file roots
    ///
    /// Marks the storage dirty. Call `flush()` to persist the change.
    pub fn set_roots(&self, new_roots: Vec<IpldCid>) {
        *self.roots.write().unwrap_or_else(PoisonError::into_inner) = new_roots;
        self.dirty.store(true, Ordering::Release);
    }

    /// Write blocks back to the CAR file if anything changed since the last flush
    pub async fn flush(&self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }

        let blocks = self
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let roots = self.roots();
        crate::car::write_car(&self.path, roots, blocks)
            .await
            .map_err(|e| {
                RepoError::storage(e)
                    .with_context(format!("flushing blocks to {}", self.path.display()))
            })?;

        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Check if store has unflushed changes
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Get the path to the CAR file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockStore for FileBlockStore {
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        Ok(self
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cid)
            .cloned())
    }

    async fn put(&self, data: &[u8]) -> Result<IpldCid> {
        let cid = compute_cid(data)?;
        let inserted = {
            let mut store = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
            if store.contains_key(&cid) {
                false
            } else {
                store.insert(cid, Bytes::copy_from_slice(data));
                true
            }
        };
        if inserted {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(cid)
    }

    async fn has(&self, cid: &IpldCid) -> Result<bool> {
        Ok(self
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(cid))
    }

    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()> {
        let mut store = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
        for (cid, data) in blocks {
            store.entry(cid).or_insert(data);
        }
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>> {
        let store = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(cids.iter().map(|cid| store.get(cid).cloned()).collect())
    }
}
