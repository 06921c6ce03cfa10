//! CAR file reading utilities
//!
//! Provides functions for reading CAR files into memory or streaming them
//! block by block. Nothing here checks block hashes; callers ingesting
//! untrusted data run [`verify_block`](crate::codec::verify_block) on each block.

use std::collections::BTreeMap;
use std::path::Path;
use std::pin::Pin;

use bytes::Bytes;
use cid::Cid as IpldCid;
use iroh_car::CarReader;
use n0_future::stream::{Stream, StreamExt};
use tokio::fs::File;
use tokio::io::AsyncRead;

use crate::error::{RepoError, Result, SyncError};

/// Parsed CAR file data
#[derive(Debug, Clone, Default)]
pub struct ParsedCar {
    /// Root CIDs from the CAR header
    pub roots: Vec<IpldCid>,
    /// All blocks in file order
    pub blocks: Vec<(IpldCid, Bytes)>,
}

impl ParsedCar {
    /// The first root CID
    pub fn root(&self) -> Result<IpldCid> {
        self.roots.first().copied().ok_or_else(|| SyncError::NoRoot.into())
    }

    /// Blocks keyed by CID
    ///
    /// When a CID appears more than once the first occurrence wins.
    pub fn block_map(&self) -> BTreeMap<IpldCid, Bytes> {
        let mut map = BTreeMap::new();
        for (cid, data) in &self.blocks {
            map.entry(*cid).or_insert_with(|| data.clone());
        }
        map
    }
}

async fn read_all<R: AsyncRead + Send + Unpin>(reader: R) -> Result<ParsedCar> {
    let reader = CarReader::new(reader).await.map_err(RepoError::car_parse)?;
    let roots = reader.header().roots().to_vec();

    let mut blocks = Vec::new();
    let stream = reader.stream();
    n0_future::pin!(stream);

    while let Some(result) = stream.next().await {
        let (cid, data) = result.map_err(RepoError::car_parse)?;
        blocks.push((cid, Bytes::from(data)));
    }

    Ok(ParsedCar { roots, blocks })
}

/// Read entire CAR file into memory
///
/// For large CAR files, consider using `stream_car()` instead.
pub async fn read_car(path: impl AsRef<Path>) -> Result<ParsedCar> {
    let file = File::open(path).await.map_err(RepoError::io)?;
    read_all(file).await
}

/// Read CAR file header (roots only)
///
/// Useful for checking roots without loading all blocks.
pub async fn read_car_header(path: impl AsRef<Path>) -> Result<Vec<IpldCid>> {
    let file = File::open(path).await.map_err(RepoError::io)?;
    let reader = CarReader::new(file).await.map_err(RepoError::car_parse)?;
    Ok(reader.header().roots().to_vec())
}

/// Parse in-memory CAR bytes (sync payloads, record proofs)
pub async fn parse_car_bytes(data: &[u8]) -> Result<ParsedCar> {
    read_all(data).await
}

/// Stream CAR blocks without loading entire file into memory
pub async fn stream_car(path: impl AsRef<Path>) -> Result<CarBlockStream> {
    let file = File::open(path).await.map_err(RepoError::io)?;
    let reader = CarReader::new(file).await.map_err(RepoError::car_parse)?;

    let roots = reader.header().roots().to_vec();
    let stream = Box::pin(reader.stream());

    Ok(CarBlockStream { stream, roots })
}

/// Streaming CAR block reader
pub struct CarBlockStream {
    stream: Pin<
        Box<dyn Stream<Item = std::result::Result<(IpldCid, Vec<u8>), iroh_car::Error>> + Send>,
    >,
    roots: Vec<IpldCid>,
}

impl CarBlockStream {
    /// Get next block from the stream
    ///
    /// Returns `None` when stream is exhausted.
    pub async fn next(&mut self) -> Result<Option<(IpldCid, Bytes)>> {
        match self.stream.next().await {
            Some(result) => {
                let (cid, data) = result.map_err(RepoError::car_parse)?;
                Ok(Some((cid, Bytes::from(data))))
            }
            None => Ok(None),
        }
    }

    /// Get the CAR file roots
    pub fn roots(&self) -> &[IpldCid] {
        &self.roots
    }
}

impl std::fmt::Debug for CarBlockStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarBlockStream")
            .field("roots", &self.roots)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DAG_CBOR_CID_CODEC;
    use arbor_common::crypto::SHA2_256;
    use iroh_car::CarWriter;
    use tempfile::NamedTempFile;
    use tokio::io::AsyncWriteExt;

    async fn make_test_car(roots: Vec<IpldCid>, blocks: Vec<(IpldCid, Vec<u8>)>) -> Vec<u8> {
        let mut buf = Vec::new();
        let header = iroh_car::CarHeader::new_v1(roots);
        let mut writer = CarWriter::new(header, &mut buf);

        for (cid, data) in blocks {
            writer.write(cid, data).await.unwrap();
        }

        writer.finish().await.unwrap();
        buf.flush().await.unwrap();
        buf
    }

    fn make_test_cid(value: u8) -> IpldCid {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest([value]);
        let mh = multihash::Multihash::wrap(SHA2_256, &hash).unwrap();
        IpldCid::new_v1(DAG_CBOR_CID_CODEC, mh)
    }

    #[tokio::test]
    async fn test_parse_car_with_blocks() {
        let cid1 = make_test_cid(1);
        let cid2 = make_test_cid(2);

        let car_bytes =
            make_test_car(vec![cid1], vec![(cid1, vec![1, 2, 3]), (cid2, vec![4, 5, 6])]).await;

        let parsed = parse_car_bytes(&car_bytes).await.unwrap();
        assert_eq!(parsed.root().unwrap(), cid1);
        assert_eq!(parsed.blocks.len(), 2);
        // file order is preserved
        assert_eq!(parsed.blocks[0].0, cid1);
        assert_eq!(parsed.block_map().get(&cid2).unwrap().as_ref(), &[4, 5, 6]);
    }

    #[tokio::test]
    async fn test_duplicate_blocks_keep_first() {
        let cid = make_test_cid(1);
        let car_bytes = make_test_car(vec![cid], vec![(cid, vec![1]), (cid, vec![2])]).await;

        let parsed = parse_car_bytes(&car_bytes).await.unwrap();
        assert_eq!(parsed.blocks.len(), 2);
        assert_eq!(parsed.block_map().get(&cid).unwrap().as_ref(), &[1]);
    }

    #[tokio::test]
    async fn test_garbage_is_car_error() {
        let err = parse_car_bytes(&[0xff, 0xff, 0xff]).await.unwrap_err();
        assert_eq!(err.kind(), &crate::RepoErrorKind::Car);
    }

    #[tokio::test]
    async fn test_read_car_from_file() {
        let cid1 = make_test_cid(1);
        let car_bytes = make_test_car(vec![cid1], vec![(cid1, vec![1, 2, 3])]).await;

        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), &car_bytes).await.unwrap();

        let parsed = read_car(temp_file.path()).await.unwrap();
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(read_car_header(temp_file.path()).await.unwrap(), vec![cid1]);

        let mut stream = stream_car(temp_file.path()).await.unwrap();
        assert_eq!(stream.roots(), &[cid1]);
        let (cid, data) = stream.next().await.unwrap().unwrap();
        assert_eq!(cid, cid1);
        assert_eq!(data.as_ref(), &[1, 2, 3]);
        assert!(stream.next().await.unwrap().is_none());
    }
}
