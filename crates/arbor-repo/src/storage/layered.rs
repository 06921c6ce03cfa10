//! Layered block storage for staging uncommitted blocks
//!
//! Reads check a writable overlay first, then fall back to a read-only base.
//! All writes land in the overlay, so the base store never sees blocks from a
//! write that is later abandoned.

use crate::error::Result;
use crate::storage::BlockStore;
use bytes::Bytes;
use cid::Cid as IpldCid;
use std::sync::Arc;

/// Layered block storage with a writable overlay and read-only base
///
/// Used in two places:
/// 1. The write pipeline stages new MST nodes, records and the commit in a
///    [`MemoryBlockStore`](crate::storage::MemoryBlockStore) overlay, and only
///    copies the reachable subset into the base once the commit is signed.
/// 2. Sync import overlays the delivered blocks on local storage to check
///    completeness before anything is persisted.
///
/// # Example
///
/// ```rust,ignore
/// use arbor_repo::storage::{LayeredBlockStore, MemoryBlockStore};
/// use std::sync::Arc;
///
/// let base = Arc::new(MemoryBlockStore::new());
/// let staged = LayeredBlockStore::new(MemoryBlockStore::new(), base);
/// ```
#[derive(Clone)]
pub struct LayeredBlockStore<W: BlockStore, B: BlockStore> {
    writable: W,
    base: Arc<B>,
}

impl<W: BlockStore, B: BlockStore> LayeredBlockStore<W, B> {
    /// Create a new layered storage
    ///
    /// - `writable`: Top layer receiving all writes
    /// - `base`: Bottom layer for fallback reads
    pub fn new(writable: W, base: Arc<B>) -> Self {
        Self { writable, base }
    }

    /// Get reference to the writable layer
    pub fn writable(&self) -> &W {
        &self.writable
    }

    /// Get reference to the base layer
    pub fn base(&self) -> &Arc<B> {
        &self.base
    }
}

impl<W: BlockStore + Sync + 'static, B: BlockStore + Sync + Send + 'static> BlockStore
    for LayeredBlockStore<W, B>
{
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        if let Some(data) = self.writable.get(cid).await? {
            return Ok(Some(data));
        }
        self.base.get(cid).await
    }

    async fn put(&self, data: &[u8]) -> Result<IpldCid> {
        self.writable.put(data).await
    }

    async fn has(&self, cid: &IpldCid) -> Result<bool> {
        if self.writable.has(cid).await? {
            return Ok(true);
        }
        self.base.has(cid).await
    }

    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()> {
        self.writable.put_many(blocks).await
    }

    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>> {
        let mut results = Vec::with_capacity(cids.len());
        for cid in cids {
            results.push(self.get(cid).await?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlockStore;

    #[tokio::test]
    async fn test_layered_read_from_writable() {
        let base = Arc::new(MemoryBlockStore::new());
        let writable = MemoryBlockStore::new();
        let cid = writable.put(b"test data").await.unwrap();

        let layered = LayeredBlockStore::new(writable, base);
        let data = layered.get(&cid).await.unwrap();
        assert_eq!(&*data.unwrap(), b"test data");
    }

    #[tokio::test]
    async fn test_layered_fallback_to_base() {
        let base = Arc::new(MemoryBlockStore::new());
        let cid = base.put(b"base data").await.unwrap();

        let layered = LayeredBlockStore::new(MemoryBlockStore::new(), base);
        let data = layered.get(&cid).await.unwrap();
        assert_eq!(&*data.unwrap(), b"base data");
    }

    #[tokio::test]
    async fn test_layered_writes_to_writable_only() {
        let base = Arc::new(MemoryBlockStore::new());
        let writable = MemoryBlockStore::new();
        let layered = LayeredBlockStore::new(writable.clone(), base.clone());

        let cid = layered.put(b"new data").await.unwrap();
        assert!(writable.has(&cid).await.unwrap());
        assert!(!base.has(&cid).await.unwrap());
        assert!(layered.has(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_layered_get_many_spans_layers() {
        let base = Arc::new(MemoryBlockStore::new());
        let writable = MemoryBlockStore::new();
        let base_cid = base.put(b"base").await.unwrap();
        let top_cid = writable.put(b"top").await.unwrap();

        let layered = LayeredBlockStore::new(writable, base);
        let got = layered
            .get_many(&[top_cid, cid::Cid::default(), base_cid])
            .await
            .unwrap();
        assert_eq!(got[0].as_deref(), Some(&b"top"[..]));
        assert!(got[1].is_none());
        assert_eq!(got[2].as_deref(), Some(&b"base"[..]));
    }
}
