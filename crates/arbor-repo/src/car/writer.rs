//! CAR file writing utilities

use std::path::Path;

use bytes::Bytes;
use cid::Cid as IpldCid;
use iroh_car::CarWriter;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{RepoError, Result};
use crate::mst::tree::Mst;
use crate::storage::{BlockStore, get_required};

/// Write blocks through a CAR writer, in the order given
///
/// The header is only emitted with the first block, so an empty block set is
/// rejected rather than producing an unreadable file.
async fn write_blocks<W: AsyncWrite + Send + Unpin>(
    writer: W,
    roots: Vec<IpldCid>,
    blocks: impl IntoIterator<Item = (IpldCid, Bytes)>,
) -> Result<W> {
    if roots.is_empty() {
        return Err(RepoError::car(std::io::Error::other(
            "CAR files need at least one root",
        )));
    }

    let header = iroh_car::CarHeader::new_v1(roots);
    let mut writer = CarWriter::new(header, writer);

    let mut written = 0usize;
    for (cid, data) in blocks {
        writer.write(cid, data.as_ref()).await.map_err(RepoError::car)?;
        written += 1;
    }
    if written == 0 {
        return Err(RepoError::car(std::io::Error::other("CAR file has no blocks")));
    }

    writer.finish().await.map_err(RepoError::car)
}

/// Write blocks to CAR file
///
/// Roots should contain commit CID(s). Blocks are written in iteration order.
pub async fn write_car(
    path: impl AsRef<Path>,
    roots: Vec<IpldCid>,
    blocks: impl IntoIterator<Item = (IpldCid, Bytes)>,
) -> Result<()> {
    let file = File::create(path).await.map_err(RepoError::io)?;
    let mut file = write_blocks(file, roots, blocks).await?;
    file.flush().await.map_err(RepoError::io)?;
    Ok(())
}

/// Write blocks to CAR bytes (in-memory)
///
/// Like `write_car()` but writes to a `Vec<u8>` instead of a file.
pub async fn write_car_bytes(
    root: IpldCid,
    blocks: impl IntoIterator<Item = (IpldCid, Bytes)>,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    write_blocks(&mut buffer, vec![root], blocks).await?;
    buffer.flush().await.map_err(RepoError::io)?;
    Ok(buffer)
}

async fn write_repo<W: AsyncWrite + Send + Unpin, S: BlockStore + Sync + 'static>(
    writer: W,
    commit_cid: IpldCid,
    mst: &Mst<S>,
) -> Result<W> {
    let header = iroh_car::CarHeader::new_v1(vec![commit_cid]);
    let mut writer = CarWriter::new(header, writer);

    let commit = get_required(&**mst.storage(), &commit_cid, "commit").await?;
    writer
        .write(commit_cid, &commit)
        .await
        .map_err(RepoError::car)?;

    mst.write_blocks_to_car(&mut writer).await?;

    writer.finish().await.map_err(RepoError::car)
}

/// Write commit + MST + records to a CAR file
///
/// Streams blocks straight from storage: the commit first, then every node
/// followed by what it references.
pub async fn export_repo_car<S: BlockStore + Sync + 'static>(
    path: impl AsRef<Path>,
    commit_cid: IpldCid,
    mst: &Mst<S>,
) -> Result<()> {
    let file = File::create(path).await.map_err(RepoError::io)?;
    let mut file = write_repo(file, commit_cid, mst).await?;
    file.flush().await.map_err(RepoError::io)?;
    Ok(())
}

/// Write commit + MST + records to CAR bytes
pub async fn export_repo_car_bytes<S: BlockStore + Sync + 'static>(
    commit_cid: IpldCid,
    mst: &Mst<S>,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    write_repo(&mut buffer, commit_cid, mst).await?;
    buffer.flush().await.map_err(RepoError::io)?;
    Ok(buffer)
}
