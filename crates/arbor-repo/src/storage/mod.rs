//! Block storage abstraction for MST nodes, commits and records

use crate::error::Result;
use bytes::Bytes;
use cid::Cid as IpldCid;

/// Async content-addressed block storage
///
/// Maps a CID to the immutable bytes it was derived from. Implementations might use:
/// - In-memory map ([`MemoryBlockStore`])
/// - CAR file ([`FileBlockStore`])
/// - A staging overlay on top of another store ([`LayeredBlockStore`])
/// - SQLite/RocksDB (user-provided)
///
/// Writes are idempotent puts keyed by content hash, so concurrent puts of the
/// same block never conflict. Deletion is deliberately absent: retention and
/// garbage collection belong to whoever owns the store.
///
/// `get` returns `Ok(None)` for a missing block. Callers that *follow a
/// reference* turn that into [`RepoErrorKind::NotFound`](crate::RepoErrorKind::NotFound),
/// which is retryable by refetching from a peer and never means "absent key".
///
/// Clone is required so trees can share storage references across operations,
/// and stores are shared between tasks, hence `Send + Sync`.
#[trait_variant::make(Send)]
pub trait BlockStore: Clone + Send + Sync {
    /// Get a block by CID
    ///
    /// Returns `None` if the block is not found.
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>>;

    /// Put a block, return its CID
    ///
    /// The CID is calculated from the data using SHA-256 and the DAG-CBOR codec,
    /// so the same bytes always produce the same CID. Storing a block twice is a no-op.
    async fn put(&self, data: &[u8]) -> Result<IpldCid>;

    /// Check if a block exists without retrieving it
    async fn has(&self, cid: &IpldCid) -> Result<bool>;

    /// Put many blocks at once
    ///
    /// The provided CIDs are trusted to match the data; callers ingesting
    /// untrusted blocks must run [`verify_block`](crate::codec::verify_block) first.
    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()>;

    /// Get multiple blocks at once
    ///
    /// Returns a vec of the same length as the input, with `None` for missing blocks.
    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>>;
}

pub mod file;
pub mod layered;
pub mod memory;

pub use file::FileBlockStore;
pub use layered::LayeredBlockStore;
pub use memory::MemoryBlockStore;

/// Fetch a block that must exist
///
/// A missing block is a `NotFound` error naming the CID, never `None`.
pub async fn get_required<S: BlockStore + Sync>(
    storage: &S,
    cid: &IpldCid,
    what: &str,
) -> Result<Bytes> {
    storage
        .get(cid)
        .await?
        .ok_or_else(|| crate::error::RepoError::block_not_found(what, cid))
}
