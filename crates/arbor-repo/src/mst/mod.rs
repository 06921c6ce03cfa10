//! Merkle Search Tree implementation

pub mod cursor;
pub mod diff;
pub mod node;
pub mod tree;
pub mod util;

pub use cursor::{CursorPosition, MstCursor};
pub use diff::{MstDiff, diff};
pub use node::{NodeData, NodeEntry, TreeEntry};
pub use tree::{Mst, WriteOp};
pub use util::{layer_for_key, validate_key};
