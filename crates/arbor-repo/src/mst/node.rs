//! MST node data structures

use std::fmt;

use bytes::Bytes;
use cid::Cid as IpldCid;
use smol_str::SmolStr;

use super::util::common_prefix_len;
use crate::error::{MstError, Result};

/// Entry in an MST node, either a subtree pointer or a leaf
///
/// This is the in-memory representation used for tree operations.
/// Entries are kept flat and interleaved, `[Tree, Leaf, Tree, Leaf, Leaf, Tree]`,
/// with leaves strictly sorted and never two `Tree`s adjacent.
///
/// The wire format is different; see [`NodeData`] and [`TreeEntry`].
#[derive(Clone, PartialEq, Eq)]
pub enum NodeEntry {
    /// Subtree reference
    Tree(IpldCid),

    /// Leaf node with key-value pair
    Leaf {
        /// Full key (not prefix-compressed in memory)
        key: SmolStr,
        /// CID of the record value
        value: IpldCid,
    },
}

impl fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEntry::Tree(cid) => write!(f, "Tree({})", cid),
            NodeEntry::Leaf { key, value } => {
                write!(f, "Leaf {{ key: {}, value: {} }}", key, value)
            }
        }
    }
}

impl NodeEntry {
    /// Check if this is a tree entry
    pub fn is_tree(&self) -> bool {
        matches!(self, NodeEntry::Tree(_))
    }

    /// Check if this is a leaf entry
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeEntry::Leaf { .. })
    }

    /// Get the key if this is a leaf
    pub fn leaf_key(&self) -> Option<&str> {
        match self {
            NodeEntry::Leaf { key, .. } => Some(key.as_str()),
            NodeEntry::Tree(_) => None,
        }
    }

    /// Get the subtree pointer if this is a tree
    pub fn tree(&self) -> Option<&IpldCid> {
        match self {
            NodeEntry::Tree(cid) => Some(cid),
            NodeEntry::Leaf { .. } => None,
        }
    }
}

/// Wire format entry: a prefix-compressed leaf with an optional right subtree
///
/// Fields are declared in canonical DAG-CBOR key order (k, p, t, v).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TreeEntry {
    /// Key suffix after the shared prefix, as a CBOR byte string
    #[serde(rename = "k", with = "crate::commit::serde_bytes_helper")]
    pub key_suffix: Bytes,

    /// Number of leading bytes shared with the previous key in this node
    #[serde(rename = "p")]
    pub prefix_len: u8,

    /// Subtree holding keys between this entry and the next
    ///
    /// Serialized as explicit `null` when absent.
    #[serde(rename = "t")]
    pub tree: Option<IpldCid>,

    /// CID of the record value
    #[serde(rename = "v")]
    pub value: IpldCid,
}

/// Wire format node data (serialized as DAG-CBOR)
///
/// **Serialization (flat → wire):**
/// - First entry if `Tree` → becomes `left`
/// - Each `Leaf` → becomes an entry in `entries`
/// - `Tree` after `Leaf` → becomes that leaf's `tree`
///
/// Absent pointers are always written as `null`; skipping them would change
/// the bytes and therefore the CID.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeData {
    /// Entries in this node (sorted by full key, prefix-compressed)
    #[serde(rename = "e")]
    pub entries: Vec<TreeEntry>,

    /// Left-most subtree pointer
    #[serde(rename = "l")]
    pub left: Option<IpldCid>,
}

impl NodeData {
    /// The node of an empty tree: `{e: [], l: null}`
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            left: None,
        }
    }

    /// Compress flat entries into wire format
    pub fn from_entries(entries: &[NodeEntry]) -> Result<Self> {
        let mut data = NodeData::empty();
        let mut iter = entries.iter().peekable();

        if let Some(NodeEntry::Tree(cid)) = iter.peek() {
            data.left = Some(*cid);
            iter.next();
        }

        let mut last_key = "";
        while let Some(entry) = iter.next() {
            let NodeEntry::Leaf { key, value } = entry else {
                return Err(
                    MstError::InvalidNode("two subtrees adjacent in node".into()).into(),
                );
            };

            let prefix_len = common_prefix_len(last_key, key);
            let tree = match iter.peek() {
                Some(NodeEntry::Tree(cid)) => {
                    let cid = *cid;
                    iter.next();
                    Some(cid)
                }
                _ => None,
            };

            data.entries.push(TreeEntry {
                prefix_len: prefix_len.try_into().map_err(|_| {
                    MstError::InvalidNode(format!("prefix length {} exceeds u8::MAX", prefix_len))
                })?,
                key_suffix: Bytes::copy_from_slice(&key.as_bytes()[prefix_len..]),
                value: *value,
                tree,
            });
            last_key = key.as_str();
        }

        Ok(data)
    }

    /// Expand wire format into flat entries, reconstructing full keys
    ///
    /// Fails on prefix lengths that overrun the previous key, keys that are
    /// not UTF-8, and keys that are not strictly ascending.
    pub fn into_entries(self) -> Result<Vec<NodeEntry>> {
        let mut entries = Vec::with_capacity(self.entries.len() * 2 + 1);
        if let Some(left) = self.left {
            entries.push(NodeEntry::Tree(left));
        }

        let mut last_key: Vec<u8> = Vec::new();
        for (i, entry) in self.entries.into_iter().enumerate() {
            let prefix_len = entry.prefix_len as usize;
            if prefix_len > last_key.len() {
                return Err(MstError::InvalidNode(format!(
                    "prefix length {} longer than previous key",
                    prefix_len
                ))
                .into());
            }

            let mut full = last_key[..prefix_len].to_vec();
            full.extend_from_slice(&entry.key_suffix);
            if i > 0 && full <= last_key {
                return Err(MstError::InvalidNode("node keys are not sorted".into()).into());
            }

            let key = std::str::from_utf8(&full)
                .map_err(|e| MstError::InvalidNode(format!("invalid UTF-8 in key: {}", e)))?;
            entries.push(NodeEntry::Leaf {
                key: SmolStr::new(key),
                value: entry.value,
            });
            if let Some(tree) = entry.tree {
                entries.push(NodeEntry::Tree(tree));
            }
            last_key = full;
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DAG_CBOR_CID_CODEC;
    use arbor_common::crypto::SHA2_256;

    fn test_cid(n: u8) -> IpldCid {
        let mh = multihash::Multihash::wrap(SHA2_256, &[n; 32]).unwrap();
        IpldCid::new_v1(DAG_CBOR_CID_CODEC, mh)
    }

    fn leaf(key: &str, n: u8) -> NodeEntry {
        NodeEntry::Leaf {
            key: SmolStr::new(key),
            value: test_cid(n),
        }
    }

    #[test]
    fn empty_node_encoding() {
        let bytes = crate::codec::encode(&NodeData::empty()).unwrap();
        // {"e": [], "l": null}
        assert_eq!(bytes, vec![0xa2, 0x61, b'e', 0x80, 0x61, b'l', 0xf6]);
    }

    #[test]
    fn prefix_compression() {
        let entries = vec![
            NodeEntry::Tree(test_cid(9)),
            leaf("com.example/abc", 1),
            leaf("com.example/abd", 2),
            NodeEntry::Tree(test_cid(8)),
            leaf("com.other/x", 3),
        ];
        let data = NodeData::from_entries(&entries).unwrap();

        assert_eq!(data.left, Some(test_cid(9)));
        assert_eq!(data.entries.len(), 3);
        assert_eq!(data.entries[0].prefix_len, 0);
        assert_eq!(data.entries[0].key_suffix.as_ref(), b"com.example/abc");
        assert_eq!(data.entries[1].prefix_len, 14);
        assert_eq!(data.entries[1].key_suffix.as_ref(), b"d");
        assert_eq!(data.entries[1].tree, Some(test_cid(8)));
        assert_eq!(data.entries[2].prefix_len, 4);
        assert_eq!(data.entries[2].key_suffix.as_ref(), b"other/x");

        assert_eq!(data.into_entries().unwrap(), entries);
    }

    #[test]
    fn adjacent_trees_rejected() {
        let entries = vec![
            NodeEntry::Tree(test_cid(1)),
            NodeEntry::Tree(test_cid(2)),
        ];
        assert!(NodeData::from_entries(&entries).is_err());
    }

    #[test]
    fn bad_prefix_rejected() {
        let data = NodeData {
            entries: vec![TreeEntry {
                key_suffix: Bytes::from_static(b"abc"),
                prefix_len: 4,
                tree: None,
                value: test_cid(1),
            }],
            left: None,
        };
        let err = data.into_entries().unwrap_err();
        assert_eq!(err.kind(), &crate::RepoErrorKind::InvalidMst);
    }

    #[test]
    fn unsorted_keys_rejected() {
        let data = NodeData {
            entries: vec![
                TreeEntry {
                    key_suffix: Bytes::from_static(b"col/b"),
                    prefix_len: 0,
                    tree: None,
                    value: test_cid(1),
                },
                TreeEntry {
                    key_suffix: Bytes::from_static(b"a"),
                    prefix_len: 4,
                    tree: None,
                    value: test_cid(2),
                },
            ],
            left: None,
        };
        assert!(data.into_entries().is_err());
    }
}
