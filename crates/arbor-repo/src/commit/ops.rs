//! Per-commit record operations handed to the event sequencer

use cid::Cid as IpldCid;
use smol_str::SmolStr;

/// Kind of change a write makes to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
    /// Record did not exist before
    Create,
    /// Record existed and now has a different CID
    Update,
    /// Record was removed
    Delete,
}

impl WriteAction {
    /// Lowercase name as used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteAction::Create => "create",
            WriteAction::Update => "update",
            WriteAction::Delete => "delete",
        }
    }
}

/// A single record change within a commit
///
/// `cid` is the new record CID (`None` for deletes); `prev` is the CID the
/// record had before the commit (`None` for creates). Carrying both makes the
/// operation invertible against the previous tree.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RepoOp {
    /// Operation type
    pub action: WriteAction,
    /// Record path (`<collection>/<record-key>`)
    pub path: SmolStr,
    /// New record CID
    pub cid: Option<IpldCid>,
    /// Previous record CID
    pub prev: Option<IpldCid>,
}
