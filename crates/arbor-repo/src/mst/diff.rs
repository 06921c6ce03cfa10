//! MST diff calculation

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid as IpldCid;
use smol_str::SmolStr;

use super::cursor::{CursorPosition, MstCursor};
use super::tree::{Mst, WriteOp};
use crate::commit::{RepoOp, WriteAction};
use crate::error::{RepoError, Result};
use crate::storage::{BlockStore, get_required};

/// Diff between two MST states
///
/// Represents the changes that turn the old tree into the new one, plus the
/// blocks a holder of the old tree needs to resolve the new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MstDiff {
    /// New records created (key, new CID)
    pub creates: Vec<(SmolStr, IpldCid)>,

    /// Records updated (key, new CID, old CID)
    pub updates: Vec<(SmolStr, IpldCid, IpldCid)>,

    /// Records deleted (key, old CID)
    pub deletes: Vec<(SmolStr, IpldCid)>,

    /// Blocks reachable from the new root that the old tree does not reference
    ///
    /// MST nodes and record CIDs, each node before anything it references, so
    /// the list can be written to a CAR in order.
    pub new_blocks: Vec<IpldCid>,

    /// Record CIDs that are newly referenced (creates + updates)
    pub new_leaf_cids: Vec<IpldCid>,

    /// Record CIDs that are no longer referenced (deletes + updates)
    pub removed_cids: Vec<IpldCid>,

    /// MST nodes the old tree used that the new tree does not
    pub removed_mst_blocks: Vec<IpldCid>,
}

impl MstDiff {
    /// Create empty diff
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if diff is empty (no changes)
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Count total operations
    pub fn op_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }

    /// Check the operation count against a per-commit limit
    pub fn validate_limits(&self, max_ops: usize) -> Result<()> {
        if self.op_count() > max_ops {
            return Err(RepoError::too_large(
                "diff operation count",
                self.op_count(),
                max_ops,
            ));
        }
        Ok(())
    }

    /// Convert the diff to write operations that replay it
    ///
    /// Update and delete operations carry the old CID as `prev`, so applying
    /// them to anything but the old tree fails.
    pub fn to_write_ops(&self) -> Vec<WriteOp> {
        let mut ops = Vec::with_capacity(self.op_count());

        for (key, cid) in &self.creates {
            ops.push(WriteOp::Create {
                key: key.clone(),
                cid: *cid,
            });
        }

        for (key, new_cid, old_cid) in &self.updates {
            ops.push(WriteOp::Update {
                key: key.clone(),
                cid: *new_cid,
                prev: Some(*old_cid),
            });
        }

        for (key, old_cid) in &self.deletes {
            ops.push(WriteOp::Delete {
                key: key.clone(),
                prev: Some(*old_cid),
            });
        }

        ops
    }

    /// Convert diff to repository operations, sorted by path
    pub fn to_repo_ops(&self) -> Vec<RepoOp> {
        let mut ops = Vec::with_capacity(self.op_count());

        for (key, cid) in &self.creates {
            ops.push(RepoOp {
                action: WriteAction::Create,
                path: key.clone(),
                cid: Some(*cid),
                prev: None,
            });
        }

        for (key, new_cid, old_cid) in &self.updates {
            ops.push(RepoOp {
                action: WriteAction::Update,
                path: key.clone(),
                cid: Some(*new_cid),
                prev: Some(*old_cid),
            });
        }

        for (key, old_cid) in &self.deletes {
            ops.push(RepoOp {
                action: WriteAction::Delete,
                path: key.clone(),
                cid: None,
                prev: Some(*old_cid),
            });
        }

        ops.sort_by(|a, b| a.path.cmp(&b.path));
        ops
    }

    /// Fetch every block in `new_blocks` from storage, in order
    ///
    /// A block missing from the store is a `NotFound` error.
    pub async fn fetch_new_blocks<S: BlockStore + Sync>(
        &self,
        storage: &S,
    ) -> Result<Vec<(IpldCid, Bytes)>> {
        let mut blocks = Vec::with_capacity(self.new_blocks.len());
        for cid in &self.new_blocks {
            blocks.push((*cid, get_required(storage, cid, "diff").await?));
        }
        Ok(blocks)
    }
}

#[derive(Default)]
struct DiffState {
    diff: MstDiff,
    /// new-side nodes stepped into, in pre-order
    new_nodes: Vec<IpldCid>,
    /// new-side blocks in emission order (nodes and records interleaved)
    candidates: Vec<IpldCid>,
    /// old-side nodes stepped into
    old_nodes: HashSet<IpldCid>,
    /// subtrees present on both sides, never loaded
    shared: HashSet<IpldCid>,
    /// record CIDs of every old-side leaf the walk passed over
    old_leaves: HashSet<IpldCid>,
}

impl DiffState {
    fn add(&mut self, key: &SmolStr, cid: IpldCid) {
        self.diff.creates.push((key.clone(), cid));
        self.diff.new_leaf_cids.push(cid);
        self.candidates.push(cid);
    }

    fn update(&mut self, key: &SmolStr, old: IpldCid, new: IpldCid) {
        self.diff.updates.push((key.clone(), new, old));
        self.diff.new_leaf_cids.push(new);
        self.diff.removed_cids.push(old);
        self.old_leaves.insert(old);
        self.candidates.push(new);
    }

    fn delete(&mut self, key: &SmolStr, cid: IpldCid) {
        self.diff.deletes.push((key.clone(), cid));
        self.diff.removed_cids.push(cid);
        self.old_leaves.insert(cid);
    }

    fn unchanged(&mut self, cid: IpldCid) {
        self.old_leaves.insert(cid);
    }

    fn new_node(&mut self, cid: IpldCid) {
        self.new_nodes.push(cid);
        self.candidates.push(cid);
    }

    fn finish(mut self) -> MstDiff {
        let new_nodes: HashSet<IpldCid> = self.new_nodes.iter().copied().collect();
        let mut seen = HashSet::new();
        let old_nodes = &self.old_nodes;
        let old_leaves = &self.old_leaves;
        let shared = &self.shared;

        self.diff.new_blocks = self
            .candidates
            .into_iter()
            .filter(|cid| {
                !old_nodes.contains(cid) && !old_leaves.contains(cid) && !shared.contains(cid)
            })
            .filter(|cid| seen.insert(*cid))
            .collect();

        let mut removed: Vec<IpldCid> = self
            .old_nodes
            .iter()
            .filter(|cid| !new_nodes.contains(cid))
            .copied()
            .collect();
        removed.sort();
        self.diff.removed_mst_blocks = removed;

        self.diff
    }
}

/// Step into the old side's current subtree, remembering the node
async fn step_old<S: BlockStore + Sync + 'static>(
    cursor: &mut MstCursor<S>,
    state: &mut DiffState,
) -> Result<()> {
    if let CursorPosition::Tree { cid } = cursor.current() {
        state.old_nodes.insert(*cid);
    }
    cursor.advance().await
}

/// Step into the new side's current subtree, recording it as a candidate block
async fn step_new<S: BlockStore + Sync + 'static>(
    cursor: &mut MstCursor<S>,
    state: &mut DiffState,
) -> Result<()> {
    if let CursorPosition::Tree { cid } = cursor.current() {
        state.new_node(*cid);
    }
    cursor.advance().await
}

/// Compute the diff from the tree at `old` to the tree at `new`
///
/// `old = None` diffs against nothing: every leaf is a create and every block
/// reachable from `new` is new. Both trees are walked in key order in
/// lockstep; identical subtrees are skipped without being loaded, so the cost
/// is proportional to the size of the change, not the size of the trees.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(storage)))]
pub async fn diff<S: BlockStore + Sync + 'static>(
    storage: &Arc<S>,
    old: Option<IpldCid>,
    new: IpldCid,
) -> Result<MstDiff> {
    let mut state = DiffState::default();
    let mut right = MstCursor::new(storage.clone(), new).await?;

    let mut left = match old {
        Some(old) => MstCursor::new(storage.clone(), old).await?,
        None => {
            while !right.is_end() {
                match right.current().clone() {
                    CursorPosition::Leaf { key, cid } => {
                        state.add(&key, cid);
                        right.advance().await?;
                    }
                    _ => step_new(&mut right, &mut state).await?,
                }
            }
            return Ok(state.finish());
        }
    };

    while !left.is_end() || !right.is_end() {
        let l = left.current().clone();
        let r = right.current().clone();

        match (&l, &r) {
            // One side finished: drain the other
            (CursorPosition::End, CursorPosition::Leaf { key, cid }) => {
                state.add(key, *cid);
                right.advance().await?;
            }
            (CursorPosition::End, _) => step_new(&mut right, &mut state).await?,
            (CursorPosition::Leaf { key, cid }, CursorPosition::End) => {
                state.delete(key, *cid);
                left.advance().await?;
            }
            (_, CursorPosition::End) => step_old(&mut left, &mut state).await?,

            (
                CursorPosition::Leaf { key: lk, cid: lc },
                CursorPosition::Leaf { key: rk, cid: rc },
            ) => {
                if lk == rk {
                    if lc != rc {
                        state.update(lk, *lc, *rc);
                    } else {
                        state.unchanged(*lc);
                    }
                    left.advance().await?;
                    right.advance().await?;
                } else if lk < rk {
                    state.delete(lk, *lc);
                    left.advance().await?;
                } else {
                    state.add(rk, *rc);
                    right.advance().await?;
                }
            }

            // Different layers: the higher side steps into its tree, or the
            // lower side catches up to the higher side's leaf
            _ if left.layer() > right.layer() => match (&l, &r) {
                (CursorPosition::Leaf { .. }, CursorPosition::Leaf { key, cid }) => {
                    state.add(key, *cid);
                    right.advance().await?;
                }
                (CursorPosition::Leaf { .. }, _) => step_new(&mut right, &mut state).await?,
                _ => step_old(&mut left, &mut state).await?,
            },
            _ if left.layer() < right.layer() => match (&l, &r) {
                (CursorPosition::Leaf { key, cid }, CursorPosition::Leaf { .. }) => {
                    state.delete(key, *cid);
                    left.advance().await?;
                }
                (_, CursorPosition::Leaf { .. }) => step_old(&mut left, &mut state).await?,
                _ => step_new(&mut right, &mut state).await?,
            },

            (CursorPosition::Tree { cid: lc }, CursorPosition::Tree { cid: rc }) => {
                if lc == rc {
                    // Identical subtree: nothing below it changed
                    state.shared.insert(*lc);
                    left.skip_subtree().await?;
                    right.skip_subtree().await?;
                } else {
                    step_old(&mut left, &mut state).await?;
                    step_new(&mut right, &mut state).await?;
                }
            }
            (CursorPosition::Leaf { .. }, CursorPosition::Tree { .. }) => {
                step_new(&mut right, &mut state).await?
            }
            (CursorPosition::Tree { .. }, CursorPosition::Leaf { .. }) => {
                step_old(&mut left, &mut state).await?
            }
        }
    }

    Ok(state.finish())
}

impl<S: BlockStore + Sync + 'static> Mst<S> {
    /// Diff from this tree to `other`
    pub async fn diff(&self, other: &Mst<S>) -> Result<MstDiff> {
        diff(self.storage(), Some(self.root()), other.root()).await
    }

    /// Diff from the empty tree to this one
    pub async fn diff_from_empty(&self) -> Result<MstDiff> {
        diff(self.storage(), None, self.root()).await
    }
}
