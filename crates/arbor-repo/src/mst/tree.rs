//! Immutable Merkle Search Tree operations

use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;

use cid::Cid as IpldCid;
use smol_str::SmolStr;

use super::node::{NodeData, NodeEntry};
use super::util;
use crate::codec;
use crate::error::{MstError, RepoError, Result};
use crate::storage::{BlockStore, get_required};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Write operation for batch application
///
/// `prev`, when given, must match the value currently stored under the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Create new record (error if exists)
    Create {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Record CID
        cid: IpldCid,
    },

    /// Update existing record (error if not exists)
    Update {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// New record CID
        cid: IpldCid,
        /// Expected current CID
        prev: Option<IpldCid>,
    },

    /// Delete record (error if not exists)
    Delete {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Expected current CID
        prev: Option<IpldCid>,
    },
}

impl WriteOp {
    /// Key this operation targets
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Create { key, .. } | WriteOp::Update { key, .. } | WriteOp::Delete { key, .. } => {
                key.as_str()
            }
        }
    }
}

/// Immutable Merkle Search Tree
///
/// An `Mst` is a storage handle plus a root CID. Nodes are values in the
/// block store: every operation that changes the tree writes the new nodes
/// along the touched path and returns a new `Mst`, leaving the original (and
/// every node it reaches) untouched and readable.
///
/// # Layer-based structure
///
/// Keys are hashed (SHA-256) and leading zero bits determine layer:
/// - Layer = floor(leading_zeros / 2) for ~4 fanout
/// - A leaf lives in the node whose layer equals its key's layer
/// - Structure is a pure function of the key set, never of insertion order
///
/// Intermediate nodes written while a batch is applied stay in the store;
/// callers that care (the repository write pipeline) stage writes in a
/// [`LayeredBlockStore`](crate::storage::LayeredBlockStore) and keep only what
/// the final root reaches.
#[derive(Debug, Clone)]
pub struct Mst<S: BlockStore> {
    storage: Arc<S>,
    root: IpldCid,
}

/// Find index of first leaf >= key
///
/// Returns `entries.len()` if all leaves are < key.
pub(crate) fn find_gt_or_equal_leaf_index(entries: &[NodeEntry], key: &str) -> usize {
    entries
        .iter()
        .position(|entry| matches!(entry, NodeEntry::Leaf { key: k, .. } if k.as_str() >= key))
        .unwrap_or(entries.len())
}

/// Subtree pointer immediately before `index`, if any
fn tree_before(entries: &[NodeEntry], index: usize) -> Option<IpldCid> {
    index
        .checked_sub(1)
        .and_then(|i| entries.get(i))
        .and_then(NodeEntry::tree)
        .copied()
}

/// Load and decompress a node
///
/// A missing block is a `NotFound` error naming the CID.
pub(crate) async fn load_entries<S: BlockStore + Sync>(
    storage: &S,
    cid: &IpldCid,
) -> Result<Vec<NodeEntry>> {
    let bytes = get_required(storage, cid, "MST node").await?;
    let data: NodeData = codec::decode(&bytes)
        .map_err(|e| e.with_context(format!("decoding MST node {}", cid)))?;
    data.into_entries()
}

/// Compute the layer of the node at `cid`
///
/// The first leaf decides; a node without leaves sits one above its first child.
/// The empty node is layer 0.
pub(crate) fn node_layer<'a, S: BlockStore + Sync + 'static>(
    storage: &'a S,
    cid: IpldCid,
) -> BoxFuture<'a, usize> {
    Box::pin(async move {
        let entries = load_entries(storage, &cid).await?;
        if let Some(key) = entries.iter().find_map(NodeEntry::leaf_key) {
            return Ok(util::layer_for_key(key));
        }
        match entries.first() {
            Some(NodeEntry::Tree(child)) => Ok(node_layer(storage, *child).await? + 1),
            _ => Ok(0),
        }
    })
}

impl<S: BlockStore + Sync + 'static> Mst<S> {
    /// Create an empty tree, writing the empty node to storage
    pub async fn new(storage: Arc<S>) -> Result<Self> {
        let root = storage.put(&codec::encode(&NodeData::empty())?).await?;
        Ok(Self { storage, root })
    }

    /// Open the tree rooted at `root`
    ///
    /// Nothing is read until an operation needs it.
    pub fn load(storage: Arc<S>, root: IpldCid) -> Self {
        Self { storage, root }
    }

    /// Root node CID
    pub fn root(&self) -> IpldCid {
        self.root
    }

    /// Get shared reference to the block storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    fn with_root(&self, root: IpldCid) -> Self {
        Self {
            storage: self.storage.clone(),
            root,
        }
    }

    async fn read_node(&self, cid: &IpldCid) -> Result<Vec<NodeEntry>> {
        load_entries(&*self.storage, cid).await
    }

    async fn write_node(&self, entries: &[NodeEntry]) -> Result<IpldCid> {
        let data = NodeData::from_entries(entries)?;
        self.storage.put(&codec::encode(&data)?).await
    }

    /// Entries of the root node
    pub async fn root_entries(&self) -> Result<Vec<NodeEntry>> {
        self.read_node(&self.root).await
    }

    /// Whether the tree holds no keys
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.root_entries().await?.is_empty())
    }

    /// Layer of the root node
    pub async fn layer(&self) -> Result<usize> {
        node_layer(&*self.storage, self.root).await
    }

    /// Get a value by key
    ///
    /// `Ok(None)` means the key is absent. A missing node block is an error.
    pub async fn get(&self, key: &str) -> Result<Option<IpldCid>> {
        util::validate_key(key)?;

        let mut cid = self.root;
        loop {
            let entries = self.read_node(&cid).await?;
            let index = find_gt_or_equal_leaf_index(&entries, key);

            if let Some(NodeEntry::Leaf { key: leaf_key, value }) = entries.get(index) {
                if leaf_key.as_str() == key {
                    return Ok(Some(*value));
                }
            }

            match tree_before(&entries, index) {
                Some(subtree) => cid = subtree,
                None => return Ok(None),
            }
        }
    }

    /// Insert or replace a key (returns new tree)
    pub async fn insert(&self, key: &str, value: IpldCid) -> Result<Self> {
        util::validate_key(key)?;

        let key_layer = util::layer_for_key(key);
        let root_layer = self.layer().await?;
        let entries = self.read_node(&self.root).await?;

        let new_entries = if key_layer > root_layer {
            // Key belongs above the current root: split everything around it
            // and stack the halves up to the new root's child layer.
            let (left, right) = self.split_entries(entries, key).await?;
            let mut left = self.write_nonempty(&left).await?;
            let mut right = self.write_nonempty(&right).await?;
            for _ in 1..(key_layer - root_layer) {
                if let Some(l) = left {
                    left = Some(self.write_node(&[NodeEntry::Tree(l)]).await?);
                }
                if let Some(r) = right {
                    right = Some(self.write_node(&[NodeEntry::Tree(r)]).await?);
                }
            }

            let mut root = Vec::with_capacity(3);
            root.extend(left.map(NodeEntry::Tree));
            root.push(NodeEntry::Leaf {
                key: SmolStr::new(key),
                value,
            });
            root.extend(right.map(NodeEntry::Tree));
            root
        } else {
            self.insert_into(entries, root_layer, key, key_layer, value)
                .await?
        };

        Ok(self.with_root(self.write_node(&new_entries).await?))
    }

    /// Replace the value of an existing key (returns new tree)
    pub async fn update(&self, key: &str, value: IpldCid) -> Result<Self> {
        if self.get(key).await?.is_none() {
            return Err(MstError::KeyMissing {
                key: key.to_string(),
            }
            .into());
        }
        self.insert(key, value).await
    }

    /// Delete a key (returns new tree)
    ///
    /// Deleting an absent key is an error.
    pub async fn delete(&self, key: &str) -> Result<Self> {
        util::validate_key(key)?;

        let entries = self.read_node(&self.root).await?;
        let mut entries = self.delete_from(entries, key).await?;

        // A root holding only a subtree pointer collapses onto that subtree
        loop {
            let only = match entries.as_slice() {
                [NodeEntry::Tree(only)] => *only,
                _ => break,
            };
            entries = self.read_node(&only).await?;
        }

        Ok(self.with_root(self.write_node(&entries).await?))
    }

    /// Apply a batch of write operations (returns new tree)
    ///
    /// Operations are applied in order. The result equals applying them one
    /// at a time; any failing operation fails the whole batch.
    ///
    /// - Create: errors if key already exists
    /// - Update: errors if key doesn't exist or `prev` doesn't match
    /// - Delete: errors if key doesn't exist or `prev` doesn't match
    pub async fn batch(&self, ops: &[WriteOp]) -> Result<Self> {
        let mut tree = self.clone();

        for op in ops {
            tree = match op {
                WriteOp::Create { key, cid } => {
                    if tree.get(key).await?.is_some() {
                        return Err(MstError::KeyExists {
                            key: key.to_string(),
                        }
                        .into());
                    }
                    tree.insert(key, *cid).await?
                }
                WriteOp::Update { key, cid, prev } => {
                    tree.check_current(key, prev.as_ref()).await?;
                    tree.insert(key, *cid).await?
                }
                WriteOp::Delete { key, prev } => {
                    tree.check_current(key, prev.as_ref()).await?;
                    tree.delete(key).await?
                }
            };
        }

        Ok(tree)
    }

    async fn check_current(&self, key: &str, expected: Option<&IpldCid>) -> Result<IpldCid> {
        let current = self.get(key).await?.ok_or_else(|| MstError::KeyMissing {
            key: key.to_string(),
        })?;
        if let Some(expected) = expected {
            if *expected != current {
                return Err(MstError::PrevMismatch {
                    key: key.to_string(),
                    expected: Some(*expected),
                    actual: Some(current),
                }
                .into());
            }
        }
        Ok(current)
    }

    async fn write_nonempty(&self, entries: &[NodeEntry]) -> Result<Option<IpldCid>> {
        if entries.is_empty() {
            Ok(None)
        } else {
            self.write_node(entries).await.map(Some)
        }
    }

    /// Insert into a node at `layer`, returning the node's new entries
    fn insert_into<'a>(
        &'a self,
        mut entries: Vec<NodeEntry>,
        layer: usize,
        key: &'a str,
        key_layer: usize,
        value: IpldCid,
    ) -> BoxFuture<'a, Vec<NodeEntry>> {
        Box::pin(async move {
            let index = find_gt_or_equal_leaf_index(&entries, key);

            if key_layer > layer {
                return Err(RepoError::invalid_mst(format!(
                    "key {} (layer {}) cannot live below layer {}",
                    key, key_layer, layer
                )));
            }

            if key_layer == layer {
                if let Some(NodeEntry::Leaf {
                    key: leaf_key,
                    value: existing,
                }) = entries.get_mut(index)
                {
                    if leaf_key.as_str() == key {
                        *existing = value;
                        return Ok(entries);
                    }
                }

                let leaf = NodeEntry::Leaf {
                    key: SmolStr::new(key),
                    value,
                };

                // The subtree before the insertion point straddles the new key
                if let Some(subtree) = tree_before(&entries, index) {
                    let sub_entries = self.read_node(&subtree).await?;
                    let (left, right) = self.split_entries(sub_entries, key).await?;

                    let mut replacement = Vec::with_capacity(3);
                    replacement.extend(self.write_nonempty(&left).await?.map(NodeEntry::Tree));
                    replacement.push(leaf);
                    replacement.extend(self.write_nonempty(&right).await?.map(NodeEntry::Tree));

                    entries.splice(index - 1..index, replacement);
                } else {
                    entries.insert(index, leaf);
                }
                return Ok(entries);
            }

            // Key belongs on a lower layer
            let child_layer = layer - 1;
            let existing = tree_before(&entries, index);
            let child_entries = match existing {
                Some(subtree) => self.read_node(&subtree).await?,
                None => Vec::new(),
            };
            let child_entries = self
                .insert_into(child_entries, child_layer, key, key_layer, value)
                .await?;
            let child = NodeEntry::Tree(self.write_node(&child_entries).await?);

            if existing.is_some() {
                entries[index - 1] = child;
            } else {
                entries.insert(index, child);
            }
            Ok(entries)
        })
    }

    /// Split a node's entries around `key`
    ///
    /// Returns (left, right) where left holds everything < key and right
    /// everything >= key. A subtree straddling the key is split recursively.
    fn split_entries<'a>(
        &'a self,
        mut entries: Vec<NodeEntry>,
        key: &'a str,
    ) -> BoxFuture<'a, (Vec<NodeEntry>, Vec<NodeEntry>)> {
        Box::pin(async move {
            let index = find_gt_or_equal_leaf_index(&entries, key);
            let mut right = entries.split_off(index);
            let mut left = entries;

            if let Some(last) = left.last().and_then(NodeEntry::tree).copied() {
                left.pop();
                let sub_entries = self.read_node(&last).await?;
                let (sub_left, sub_right) = self.split_entries(sub_entries, key).await?;
                if let Some(cid) = self.write_nonempty(&sub_left).await? {
                    left.push(NodeEntry::Tree(cid));
                }
                if let Some(cid) = self.write_nonempty(&sub_right).await? {
                    right.insert(0, NodeEntry::Tree(cid));
                }
            }

            Ok((left, right))
        })
    }

    /// Delete from a node, returning the node's new entries
    fn delete_from<'a>(
        &'a self,
        mut entries: Vec<NodeEntry>,
        key: &'a str,
    ) -> BoxFuture<'a, Vec<NodeEntry>> {
        Box::pin(async move {
            let index = find_gt_or_equal_leaf_index(&entries, key);

            let found = matches!(
                entries.get(index),
                Some(NodeEntry::Leaf { key: leaf_key, .. }) if leaf_key.as_str() == key
            );
            if found {
                let prev = tree_before(&entries, index);
                let next = entries.get(index + 1).and_then(NodeEntry::tree).copied();
                if let (Some(prev), Some(next)) = (prev, next) {
                    // Neighbouring subtrees become adjacent: merge them
                    let merged = self.append_merge(prev, next).await?;
                    entries.splice(index - 1..=index + 1, [NodeEntry::Tree(merged)]);
                } else {
                    entries.remove(index);
                }
                return Ok(entries);
            }

            if let Some(subtree) = tree_before(&entries, index) {
                let sub_entries = self.read_node(&subtree).await?;
                let sub_entries = self.delete_from(sub_entries, key).await?;
                if sub_entries.is_empty() {
                    entries.remove(index - 1);
                } else {
                    entries[index - 1] = NodeEntry::Tree(self.write_node(&sub_entries).await?);
                }
                return Ok(entries);
            }

            Err(MstError::KeyMissing {
                key: key.to_string(),
            }
            .into())
        })
    }

    /// Merge two adjacent subtrees of the same layer
    ///
    /// All keys in `right` must be greater than all keys in `left`.
    fn append_merge<'a>(&'a self, left: IpldCid, right: IpldCid) -> BoxFuture<'a, IpldCid> {
        Box::pin(async move {
            let mut left_entries = self.read_node(&left).await?;
            let right_entries = self.read_node(&right).await?;

            let left_last = left_entries.last().and_then(NodeEntry::tree).copied();
            let right_first = right_entries.first().and_then(NodeEntry::tree).copied();

            if let (Some(a), Some(b)) = (left_last, right_first) {
                let merged = self.append_merge(a, b).await?;
                left_entries.pop();
                left_entries.push(NodeEntry::Tree(merged));
                left_entries.extend(right_entries.into_iter().skip(1));
            } else {
                left_entries.extend(right_entries);
            }

            self.write_node(&left_entries).await
        })
    }

    /// Visit leaves in key order starting at the first key >= `from`
    ///
    /// Subtrees entirely below `from` are never loaded. The visitor stops
    /// the walk by returning `ControlFlow::Break`.
    fn walk_from<'a, F>(
        &'a self,
        cid: IpldCid,
        from: &'a str,
        visit: &'a mut F,
    ) -> BoxFuture<'a, ControlFlow<()>>
    where
        F: FnMut(&SmolStr, &IpldCid) -> ControlFlow<()> + Send,
    {
        Box::pin(async move {
            let entries = self.read_node(&cid).await?;
            let index = find_gt_or_equal_leaf_index(&entries, from);

            if let Some(subtree) = tree_before(&entries, index) {
                if self.walk_from(subtree, from, &mut *visit).await?.is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }

            for entry in &entries[index..] {
                let flow = match entry {
                    NodeEntry::Leaf { key, value } => visit(key, value),
                    NodeEntry::Tree(subtree) => self.walk_from(*subtree, from, &mut *visit).await?,
                };
                if flow.is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }

            Ok(ControlFlow::Continue(()))
        })
    }

    /// All leaves with key >= `key`, in order
    pub async fn walk_leaves_from(&self, key: &str) -> Result<Vec<(SmolStr, IpldCid)>> {
        let mut out = Vec::new();
        self.walk_from(self.root, key, &mut |k: &SmolStr, v: &IpldCid| {
            out.push((k.clone(), *v));
            ControlFlow::Continue(())
        })
        .await?;
        Ok(out)
    }

    /// Get all leaf entries (key-CID pairs) in lexicographic order
    pub async fn leaves(&self) -> Result<Vec<(SmolStr, IpldCid)>> {
        self.walk_leaves_from("").await
    }

    /// Total number of leaves
    pub async fn leaf_count(&self) -> Result<usize> {
        let mut count = 0usize;
        self.walk_from(self.root, "", &mut |_: &SmolStr, _: &IpldCid| {
            count += 1;
            ControlFlow::Continue(())
        })
        .await?;
        Ok(count)
    }

    /// Up to `count` leaves strictly after `after` and strictly before `before`
    pub async fn list(
        &self,
        count: usize,
        after: Option<&str>,
        before: Option<&str>,
    ) -> Result<Vec<(SmolStr, IpldCid)>> {
        let mut out = Vec::new();
        self.walk_from(self.root, after.unwrap_or(""), &mut |k: &SmolStr, v: &IpldCid| {
            if Some(k.as_str()) == after {
                return ControlFlow::Continue(());
            }
            if out.len() >= count {
                return ControlFlow::Break(());
            }
            if let Some(before) = before {
                if k.as_str() >= before {
                    return ControlFlow::Break(());
                }
            }
            out.push((k.clone(), *v));
            ControlFlow::Continue(())
        })
        .await?;
        Ok(out)
    }

    /// Up to `count` leaves whose key starts with `prefix`
    pub async fn list_with_prefix(
        &self,
        prefix: &str,
        count: usize,
    ) -> Result<Vec<(SmolStr, IpldCid)>> {
        let mut out = Vec::new();
        self.walk_from(self.root, prefix, &mut |k: &SmolStr, v: &IpldCid| {
            if out.len() >= count || !k.starts_with(prefix) {
                return ControlFlow::Break(());
            }
            out.push((k.clone(), *v));
            ControlFlow::Continue(())
        })
        .await?;
        Ok(out)
    }

    /// Get all CIDs in the merkle path to a key
    ///
    /// Returns the node CIDs from the root down to where `key` lives or would
    /// live, followed by the record CID if the key is present. Together with
    /// those node blocks this proves either existence or absence.
    pub async fn cids_for_path(&self, key: &str) -> Result<Vec<IpldCid>> {
        util::validate_key(key)?;

        let mut cids = Vec::new();
        let mut cid = self.root;
        loop {
            cids.push(cid);
            let entries = self.read_node(&cid).await?;
            let index = find_gt_or_equal_leaf_index(&entries, key);

            if let Some(NodeEntry::Leaf { key: leaf_key, value }) = entries.get(index) {
                if leaf_key.as_str() == key {
                    cids.push(*value);
                    return Ok(cids);
                }
            }

            match tree_before(&entries, index) {
                Some(subtree) => cid = subtree,
                None => return Ok(cids),
            }
        }
    }

    /// Every node CID in the tree, parents before children
    pub async fn node_cids(&self) -> Result<Vec<IpldCid>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(cid) = stack.pop() {
            out.push(cid);
            let entries = self.read_node(&cid).await?;
            // reversed so the left-most subtree is visited first
            stack.extend(entries.iter().rev().filter_map(NodeEntry::tree));
        }
        Ok(out)
    }

    /// Write all MST node and record blocks to a CAR writer
    ///
    /// Pre-order: each node, then its entries in order, a record directly
    /// after its leaf's node and a subtree before the entries that follow it.
    /// Every block written is referenced by one written earlier.
    pub async fn write_blocks_to_car<W: tokio::io::AsyncWrite + Send + Unpin>(
        &self,
        writer: &mut iroh_car::CarWriter<W>,
    ) -> Result<()> {
        self.write_node_to_car(self.root, writer).await
    }

    fn write_node_to_car<'a, W: tokio::io::AsyncWrite + Send + Unpin>(
        &'a self,
        cid: IpldCid,
        writer: &'a mut iroh_car::CarWriter<W>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let node_bytes = get_required(&*self.storage, &cid, "MST node").await?;
            writer.write(cid, &node_bytes).await.map_err(RepoError::car)?;

            let data: NodeData = codec::decode(&node_bytes)?;
            for entry in data.into_entries()? {
                match entry {
                    NodeEntry::Leaf { value, .. } => {
                        let record = get_required(&*self.storage, &value, "record").await?;
                        writer.write(value, &record).await.map_err(RepoError::car)?;
                    }
                    NodeEntry::Tree(subtree) => {
                        self.write_node_to_car(subtree, &mut *writer).await?;
                    }
                }
            }

            Ok(())
        })
    }
}
