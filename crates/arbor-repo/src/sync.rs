//! Applying delivered block sets
//!
//! Incoming CARs are untrusted. Before anything touches the base store a
//! payload must pass, in order:
//! 1. every block hashes to its CID
//! 2. the root commit is present, decodes, names the expected DID and carries
//!    a valid signature
//! 3. the rev moves forward
//! 4. everything reachable from the commit's tree is either delivered or
//!    already held locally, and every delivered node is well formed and in the
//!    shape an honest writer would produce (trimmed root, no empty subtrees)
//!
//! Only then are the delivered blocks written and the head swapped. A payload
//! that fails any step leaves the replica exactly as it was.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use arbor_common::{Did, PublicKey};
use bytes::Bytes;
use cid::Cid as IpldCid;
use smol_str::{SmolStr, format_smolstr};

use crate::car::parse_car_bytes;
use crate::codec;
use crate::commit::Commit;
use crate::config::RepoConfig;
use crate::error::{CommitError, RepoError, RepoErrorKind, Result, SyncError};
use crate::mst::{Mst, NodeData, NodeEntry, diff, layer_for_key, validate_key};
use crate::repo::{CommitData, Head, Repository};
use crate::storage::{BlockStore, LayeredBlockStore, MemoryBlockStore};

/// A CAR whose blocks hash correctly and whose root commit is signed
#[derive(Debug)]
struct SignedPayload {
    commit_cid: IpldCid,
    commit: Commit,
    blocks: BTreeMap<IpldCid, Bytes>,
}

async fn open_payload(
    car: &[u8],
    expected_did: Option<&Did>,
    pubkey: &PublicKey,
    strict: bool,
) -> Result<SignedPayload> {
    let parsed = parse_car_bytes(car).await?;
    let commit_cid = parsed.root()?;
    for (cid, data) in &parsed.blocks {
        codec::verify_block(cid, data)?;
    }
    let blocks = parsed.block_map();

    let commit_bytes = blocks
        .get(&commit_cid)
        .ok_or(SyncError::CommitNotFound { cid: commit_cid })?;
    let commit = if strict {
        Commit::from_canonical_cbor(commit_bytes)?
    } else {
        Commit::from_cbor(commit_bytes)?
    };

    if let Some(did) = expected_did {
        if commit.did() != did {
            return Err(CommitError::DidMismatch {
                commit_did: commit.did().to_string(),
                expected_did: did.to_string(),
            }
            .into());
        }
    }
    commit.verify(pubkey)?;

    Ok(SignedPayload {
        commit_cid,
        commit,
        blocks,
    })
}

/// A node still to be checked, with the key range its leaves must fall in
struct Pending {
    cid: IpldCid,
    layer: Option<usize>,
    after: Option<SmolStr>,
    before: Option<SmolStr>,
}

fn decode_node(cid: &IpldCid, bytes: &[u8], strict: bool) -> Result<Vec<NodeEntry>> {
    let data: NodeData = if strict {
        codec::decode_canonical(bytes)?
    } else {
        codec::decode(bytes)?
    };
    data.into_entries()
        .map_err(|e| e.with_context(format!("checking MST node {}", cid)))
}

/// Layer shared by every leaf of a node, or `None` for a node without leaves
fn leaf_layer(cid: &IpldCid, entries: &[NodeEntry]) -> Result<Option<usize>> {
    let mut layer = None;
    for key in entries.iter().filter_map(NodeEntry::leaf_key) {
        validate_key(key)?;
        let this = layer_for_key(key);
        match layer {
            None => layer = Some(this),
            Some(l) if l != this => {
                return Err(RepoError::invalid_mst(format!(
                    "node {} mixes leaves of layer {} and {}",
                    cid, l, this
                )));
            }
            Some(_) => {}
        }
    }
    Ok(layer)
}

/// Walk everything reachable from `root`, resolving against `delivered` first
/// and `base` second
///
/// Delivered nodes are decoded and checked; a node found only in `base` is
/// trusted along with everything below it. Returns the delivered CIDs that
/// were reached, parents before children. Any CID found in neither place
/// fails the walk as an incomplete repository.
async fn check_closure<S: BlockStore + Sync>(
    root: IpldCid,
    delivered: &BTreeMap<IpldCid, Bytes>,
    base: &S,
    strict: bool,
) -> Result<Vec<IpldCid>> {
    let mut reached = Vec::new();
    let mut missing = Vec::new();
    let mut seen = HashSet::new();

    let mut stack = vec![Pending {
        cid: root,
        layer: None,
        after: None,
        before: None,
    }];

    while let Some(Pending {
        cid,
        layer,
        after,
        before,
    }) = stack.pop()
    {
        if !seen.insert(cid) {
            continue;
        }

        let Some(bytes) = delivered.get(&cid) else {
            if !base.has(&cid).await? {
                missing.push(cid);
            }
            continue;
        };
        reached.push(cid);

        let entries = decode_node(&cid, bytes, strict)?;
        if cid == root {
            if let [NodeEntry::Tree(_)] = entries.as_slice() {
                return Err(RepoError::invalid_mst(format!(
                    "root {} is a lone subtree pointer; the tree was not trimmed",
                    cid
                )));
            }
        } else if entries.is_empty() {
            return Err(RepoError::invalid_mst(format!("interior node {} is empty", cid)));
        }
        let own_layer = match (leaf_layer(&cid, &entries)?, layer) {
            (Some(found), Some(expected)) if found != expected => {
                return Err(RepoError::invalid_mst(format!(
                    "node {} holds layer {} leaves where layer {} was expected",
                    cid, found, expected
                )));
            }
            (Some(found), _) => Some(found),
            (None, expected) => expected,
        };

        let mut lower = after.clone();
        let mut children = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            match entry {
                NodeEntry::Leaf { key, value } => {
                    let in_range = lower.as_ref().is_none_or(|lo| key > lo)
                        && before.as_ref().is_none_or(|hi| key < hi);
                    if !in_range {
                        return Err(RepoError::invalid_mst(format!(
                            "key {} in node {} is outside its parent's range",
                            key, cid
                        )));
                    }
                    lower = Some(key.clone());

                    if delivered.contains_key(value) {
                        if seen.insert(*value) {
                            reached.push(*value);
                        }
                    } else if !base.has(value).await? && !missing.contains(value) {
                        missing.push(*value);
                    }
                }
                NodeEntry::Tree(child) => {
                    let child_layer = match own_layer {
                        Some(0) => {
                            return Err(RepoError::invalid_mst(format!(
                                "layer 0 node {} has a subtree",
                                cid
                            )));
                        }
                        Some(l) => Some(l - 1),
                        None => None,
                    };
                    let upper = entries[i + 1..]
                        .iter()
                        .find_map(NodeEntry::leaf_key)
                        .map(SmolStr::new)
                        .or_else(|| before.clone());
                    children.push(Pending {
                        cid: *child,
                        layer: child_layer,
                        after: lower.clone(),
                        before: upper,
                    });
                }
            }
        }
        // left-most child on top
        stack.extend(children.into_iter().rev());
    }

    if !missing.is_empty() {
        return Err(RepoError::incomplete(&root, missing));
    }
    Ok(reached)
}

fn ordered_blocks(
    commit_cid: IpldCid,
    reached: &[IpldCid],
    delivered: &BTreeMap<IpldCid, Bytes>,
) -> Vec<(IpldCid, Bytes)> {
    std::iter::once(commit_cid)
        .chain(reached.iter().copied())
        .filter_map(|cid| delivered.get(&cid).map(|bytes| (cid, bytes.clone())))
        .collect()
}

impl<S: BlockStore + Sync + 'static> Repository<S> {
    /// Advance this replica with a delivered CAR
    ///
    /// The CAR's root must be a commit by this repository's DID, signed by
    /// `pubkey`, with a rev after the current one. Blocks the replica already
    /// holds may be omitted. On success the delivered blocks are stored, the
    /// head moves to the new commit, and the returned [`CommitData`] lists the
    /// record changes.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(did = %self.did())))]
    pub async fn apply_sync(&self, car: &[u8], pubkey: &PublicKey) -> Result<CommitData> {
        let _writer = self.writer_lock().lock().await;
        let result = self.apply_sync_locked(car, pubkey).await;

        #[cfg(feature = "tracing")]
        {
            if let Err(e) = &result {
                tracing::warn!(error = %e, kind = ?e.kind(), "rejected sync payload");
            }
        }

        result
    }

    async fn apply_sync_locked(&self, car: &[u8], pubkey: &PublicKey) -> Result<CommitData> {
        let head = self.head();
        let strict = self.config().strict_encoding;
        let payload = open_payload(car, Some(head.commit.did()), pubkey, strict).await?;
        let commit = payload.commit;

        if commit.rev() <= head.commit.rev() {
            return Err(CommitError::RevNotIncreasing {
                rev: commit.rev().to_string(),
                current: head.commit.rev().to_string(),
            }
            .into());
        }
        if commit.prev() != Some(&head.cid) {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                prev = ?commit.prev(),
                head = %head.cid,
                "sync commit does not name the local head as prev"
            );
        }

        let reached = check_closure(
            *commit.data(),
            &payload.blocks,
            &**self.storage(),
            strict,
        )
        .await?;
        let blocks = ordered_blocks(payload.commit_cid, &reached, &payload.blocks);

        let staging = Arc::new(LayeredBlockStore::new(
            MemoryBlockStore::new_from_blocks(blocks.iter().cloned().collect()),
            self.storage().clone(),
        ));
        let delta = diff(&staging, Some(head.commit.data), commit.data).await?;
        delta.validate_limits(self.config().max_ops_per_commit)?;

        self.storage().put_many(blocks.clone()).await?;
        self.set_head(Head {
            cid: payload.commit_cid,
            commit: commit.clone(),
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(
            commit = %payload.commit_cid,
            rev = %commit.rev,
            ops = delta.op_count(),
            blocks = blocks.len(),
            "applied sync commit"
        );

        Ok(CommitData {
            cid: payload.commit_cid,
            rev: commit.rev.clone(),
            since: Some(head.commit.rev.clone()),
            prev_data: Some(head.commit.data),
            ops: delta.to_repo_ops(),
            commit,
            blocks,
        })
    }

    /// Bootstrap a replica from a full CAR export
    ///
    /// The commit must verify against `pubkey` and the CAR together with
    /// whatever `storage` already holds must cover the whole tree.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub async fn import(
        storage: Arc<S>,
        car: &[u8],
        pubkey: &PublicKey,
        config: RepoConfig,
    ) -> Result<Self> {
        let payload = open_payload(car, None, pubkey, config.strict_encoding).await?;
        let reached = check_closure(
            *payload.commit.data(),
            &payload.blocks,
            &*storage,
            config.strict_encoding,
        )
        .await?;
        let blocks = ordered_blocks(payload.commit_cid, &reached, &payload.blocks);
        storage.put_many(blocks).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            did = %payload.commit.did,
            commit = %payload.commit_cid,
            rev = %payload.commit.rev,
            "imported repository"
        );

        Ok(Self::from_head(
            storage,
            config,
            Head {
                cid: payload.commit_cid,
                commit: payload.commit,
            },
        ))
    }
}

/// Check a record proof produced by [`Repository::record_proof`]
///
/// Uses only the blocks in `car`. `expected` is the record CID the caller
/// believes is current, or `None` to prove absence. Returns the signed commit
/// the proof is anchored to.
pub async fn verify_record_proof(
    car: &[u8],
    did: &Did,
    pubkey: &PublicKey,
    collection: &str,
    rkey: &str,
    expected: Option<IpldCid>,
) -> Result<Commit> {
    let payload = open_payload(car, Some(did), pubkey, true).await?;
    let key = format_smolstr!("{}/{}", collection, rkey);

    let storage = Arc::new(MemoryBlockStore::new_from_blocks(payload.blocks));
    let found = match Mst::load(storage, payload.commit.data).get(&key).await {
        Ok(found) => found,
        Err(e) if e.kind() == &RepoErrorKind::NotFound => {
            return Err(RepoError::incomplete(
                &payload.commit.data,
                e.missing_cids().to_vec(),
            )
            .with_context(format!("proof for {} is missing path nodes", key)));
        }
        Err(e) => return Err(e),
    };

    if found != expected {
        return Err(SyncError::ProofMismatch {
            key: key.to_string(),
            expected,
            found,
        }
        .into());
    }
    Ok(payload.commit)
}
