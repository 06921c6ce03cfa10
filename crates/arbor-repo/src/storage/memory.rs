//! In-memory block storage implementation

use crate::codec::compute_cid;
use crate::error::Result;
use crate::storage::BlockStore;
use bytes::Bytes;
use cid::Cid as IpldCid;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// In-memory block storage using BTreeMap
///
/// Useful for:
/// - Testing
/// - Staging blocks for a commit before they reach durable storage
/// - Small repositories that fit in memory
///
/// Clones share the same underlying map.
///
/// # Example
///
/// ```rust,ignore
/// use arbor_repo::storage::{BlockStore, MemoryBlockStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = MemoryBlockStore::new();
///
/// let data = b"\xa1\x61a\x01";
/// let cid = storage.put(data).await?;
///
/// let retrieved = storage.get(&cid).await?;
/// assert_eq!(retrieved.as_deref(), Some(&data[..]));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<BTreeMap<IpldCid, Bytes>>>,
}

impl MemoryBlockStore {
    /// Create new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create new memory store from a map of blocks
    pub fn new_from_blocks(blocks: BTreeMap<IpldCid, Bytes>) -> Self {
        Self {
            blocks: Arc::new(RwLock::new(blocks)),
        }
    }

    /// Get number of blocks stored
    pub fn len(&self) -> usize {
        self.blocks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every CID currently stored
    pub fn cids(&self) -> Vec<IpldCid> {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Remove a block
    ///
    /// Not part of [`BlockStore`]: retention is the owner's business. Exposed
    /// for garbage collection tooling and for tests that simulate a missing block.
    pub fn remove(&self, cid: &IpldCid) -> Option<Bytes> {
        self.blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cid)
    }
}

impl BlockStore for MemoryBlockStore {
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
        self.blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(cid)
            .or_insert_with(|| Bytes::copy_from_slice(data));
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
        Ok(())
    }

    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>> {
        let store = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(cids.iter().map(|cid| store.get(cid).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryBlockStore::new();
        let data = b"test data";

        let cid = store.put(data).await.unwrap();
        let retrieved = store.get(&cid).await.unwrap();

        assert_eq!(retrieved.as_deref(), Some(&data[..]));
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = MemoryBlockStore::new();
        let a = store.put(b"same").await.unwrap();
        let b = store.put(b"same").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_has() {
        let store = MemoryBlockStore::new();
        let cid = store.put(b"test data").await.unwrap();
        assert!(store.has(&cid).await.unwrap());
        assert!(!store.has(&IpldCid::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_many_and_get_many() {
        let store = MemoryBlockStore::new();

        let cid1 = compute_cid(b"data1").unwrap();
        let cid2 = compute_cid(b"data2").unwrap();

        store
            .put_many(vec![
                (cid1, Bytes::from_static(b"data1")),
                (cid2, Bytes::from_static(b"data2")),
            ])
            .await
            .unwrap();
        assert_eq!(store.len(), 2);

        let results = store
            .get_many(&[cid1, IpldCid::default(), cid2])
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_deref(), Some(&b"data1"[..]));
        assert_eq!(results[1], None);
        assert_eq!(results[2].as_deref(), Some(&b"data2"[..]));
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryBlockStore::new();
        let cid = store.put(b"data").await.unwrap();
        assert!(store.remove(&cid).is_some());
        assert!(store.is_empty());
        assert_eq!(store.get(&cid).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clone_shares_storage() {
        let store1 = MemoryBlockStore::new();
        let store2 = store1.clone();

        let cid = store1.put(b"test").await.unwrap();
        assert!(store2.has(&cid).await.unwrap());
    }
}
