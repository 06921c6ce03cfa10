//! MST cursor for in-order tree traversal

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cid::Cid as IpldCid;
use smol_str::SmolStr;

use super::node::NodeEntry;
use super::tree::{load_entries, node_layer};
use crate::error::Result;
use crate::storage::BlockStore;

/// Position within an MST traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorPosition {
    /// Pointing at a leaf entry
    Leaf {
        /// Leaf key
        key: SmolStr,
        /// Leaf CID (record value)
        cid: IpldCid,
    },

    /// Pointing at a subtree pointer
    Tree {
        /// Subtree root CID
        cid: IpldCid,
    },

    /// Past the end of traversal
    End,
}

#[derive(Debug, Clone)]
struct Frame {
    cid: IpldCid,
    layer: usize,
    entries: Vec<NodeEntry>,
    index: usize,
}

/// Cursor for navigating an MST in sorted order
///
/// - `advance()`: step into a subtree, or past a leaf
/// - `skip_subtree()`: step past the subtree at the current position without loading it
/// - `current()`: current position
///
/// A fresh cursor points at the root as a `Tree` position. Layers are tracked
/// from the root down, so comparing the layers of two cursors costs no reads.
#[derive(Debug, Clone)]
pub struct MstCursor<S: BlockStore> {
    storage: Arc<S>,
    /// Nodes we've descended into, root first
    path: Vec<Frame>,
    current: CursorPosition,
    root_layer: usize,
}

impl<S: BlockStore + Sync + 'static> MstCursor<S> {
    /// Create a cursor positioned at the root of the tree at `root`
    pub async fn new(storage: Arc<S>, root: IpldCid) -> Result<Self> {
        let root_layer = node_layer(&*storage, root).await?;
        Ok(Self {
            storage,
            path: Vec::new(),
            current: CursorPosition::Tree { cid: root },
            root_layer,
        })
    }

    /// Get current position without advancing
    pub fn current(&self) -> &CursorPosition {
        &self.current
    }

    /// Check if cursor is at end
    pub fn is_end(&self) -> bool {
        matches!(self.current, CursorPosition::End)
    }

    /// Get key at current position (if pointing at leaf)
    pub fn key(&self) -> Option<&str> {
        match &self.current {
            CursorPosition::Leaf { key, .. } => Some(key.as_str()),
            _ => None,
        }
    }

    /// Layer of the node the cursor is currently inside
    ///
    /// Before stepping into the root this is one above the root's layer.
    pub fn layer(&self) -> usize {
        match self.path.last() {
            Some(frame) => frame.layer,
            None => self.root_layer + 1,
        }
    }

    /// CID of the node the cursor is currently inside
    pub fn node(&self) -> Option<IpldCid> {
        self.path.last().map(|frame| frame.cid)
    }

    /// Advance to next position in sorted order
    ///
    /// - At a leaf: move to the next entry, popping up as nodes are exhausted
    /// - At a tree: load it and move to its first entry
    /// - At the end: stay there
    pub async fn advance(&mut self) -> Result<()> {
        match &self.current {
            CursorPosition::End => Ok(()),
            CursorPosition::Leaf { .. } => self.step_over().await,
            CursorPosition::Tree { cid } => {
                let cid = *cid;
                self.step_into(cid).await
            }
        }
    }

    /// Skip entire subtree at current position
    ///
    /// At a leaf this is the same as `advance()`.
    pub async fn skip_subtree(&mut self) -> Result<()> {
        self.step_over().await
    }

    fn step_over<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let next = match self.path.last_mut() {
                Some(frame) => {
                    frame.index += 1;
                    frame.entries.get(frame.index).map(position_of)
                }
                None => {
                    self.current = CursorPosition::End;
                    return Ok(());
                }
            };

            match next {
                Some(position) => {
                    self.current = position;
                    Ok(())
                }
                None => {
                    self.path.pop();
                    self.step_over().await
                }
            }
        })
    }

    async fn step_into(&mut self, cid: IpldCid) -> Result<()> {
        let entries = load_entries(&*self.storage, &cid).await?;
        let layer = match self.path.last() {
            Some(parent) => parent.layer.saturating_sub(1),
            None => self.root_layer,
        };

        match entries.first().map(position_of) {
            Some(first) => {
                self.path.push(Frame {
                    cid,
                    layer,
                    entries,
                    index: 0,
                });
                self.current = first;
                Ok(())
            }
            // empty tree
            None => self.step_over().await,
        }
    }
}

fn position_of(entry: &NodeEntry) -> CursorPosition {
    match entry {
        NodeEntry::Leaf { key, value } => CursorPosition::Leaf {
            key: key.clone(),
            cid: *value,
        },
        NodeEntry::Tree(cid) => CursorPosition::Tree { cid: *cid },
    }
}
