//! Error types for repository operations

use std::error::Error;
use std::fmt;

use cid::Cid as IpldCid;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

/// Repository operation error with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct RepoError {
    kind: RepoErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
    missing: Vec<IpldCid>,
}

/// Error categories for repository operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoErrorKind {
    /// Storage backend failed
    Storage,
    /// A referenced block is absent from the store
    ///
    /// Distinct from an absent key: this means the tree or commit points at a
    /// CID we cannot resolve. Recoverable by fetching the block from a peer.
    NotFound,
    /// Delivered block set does not cover everything reachable from its root
    IncompleteRepo,
    /// Decode failure, CID/content mismatch or non-canonical encoding
    MalformedEncoding,
    /// Signer unavailable or refused the payload
    Signing,
    /// Commit signature did not verify
    InvalidSignature,
    /// Another write is in flight
    Busy,
    /// Invalid MST key format
    InvalidKey,
    /// Malformed write batch
    InvalidWrite,
    /// Invalid MST structure
    InvalidMst,
    /// Invalid commit or commit chain
    InvalidCommit,
    /// Data too large (exceeds configured limits)
    TooLarge,
    /// CAR file operation failed
    Car,
    /// I/O error
    Io,
}

impl RepoError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: RepoErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
            missing: Vec::new(),
        }
    }

    /// Add a help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context information to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> &RepoErrorKind {
        &self.kind
    }

    /// CIDs that could not be resolved
    ///
    /// Populated for [`RepoErrorKind::NotFound`] and [`RepoErrorKind::IncompleteRepo`]
    /// so a sync client can request exactly those blocks from a peer.
    pub fn missing_cids(&self) -> &[IpldCid] {
        &self.missing
    }

    /// Whether retrying (after refetching or waiting) can succeed.
    ///
    /// Integrity failures are never retryable; they mean corruption or a
    /// hostile peer.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, RepoErrorKind::NotFound | RepoErrorKind::Busy)
    }

    // Constructors for different error kinds

    /// Create a storage error
    pub fn storage(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Storage, Some(Box::new(source)))
    }

    /// A block the caller needed is not in the store
    pub fn block_not_found(what: &str, cid: &IpldCid) -> Self {
        let mut err = Self::new(RepoErrorKind::NotFound, None)
            .with_context(format!("{} block not found: {}", what, cid))
            .with_help("the block can be requested from a peer that holds this repository");
        err.missing.push(*cid);
        err
    }

    /// Delivered blocks do not reach everything from the claimed root
    pub fn incomplete(root: &IpldCid, missing: Vec<IpldCid>) -> Self {
        let mut err = Self::new(RepoErrorKind::IncompleteRepo, None).with_context(format!(
            "{} block(s) reachable from {} are missing",
            missing.len(),
            root
        ));
        err.missing = missing;
        err
    }

    /// Create a malformed encoding error
    pub fn malformed(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::MalformedEncoding, Some(Box::new(source)))
    }

    /// Block bytes do not hash to the CID they were delivered under
    pub fn cid_mismatch(expected: &IpldCid, actual: &IpldCid) -> Self {
        Self::new(RepoErrorKind::MalformedEncoding, None)
            .with_context(format!(
                "block content hashes to {} but was addressed as {}",
                actual, expected
            ))
            .with_help("the block is corrupt or was tampered with")
    }

    /// Create a signing error
    pub fn signing(source: impl Into<BoxError>) -> Self {
        Self::new(RepoErrorKind::Signing, Some(source.into()))
    }

    /// Create a busy error
    pub fn busy() -> Self {
        Self::new(RepoErrorKind::Busy, None)
            .with_context("a write is already in progress on this repository".to_string())
    }

    /// Create an invalid MST error
    pub fn invalid_mst(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidMst, Some(msg.into().into()))
            .with_help("MST nodes must follow protocol structure")
    }

    /// Create an invalid commit error
    pub fn invalid_commit(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidCommit, Some(msg.into().into()))
    }

    /// Create an invalid write error
    pub fn invalid_write(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidWrite, Some(msg.into().into()))
            .with_help("the whole batch was rejected; no changes were made")
    }

    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidKey, None)
            .with_help("MST keys look like <collection>/<record-key> using [a-zA-Z0-9._:~-]")
            .with_context(format!("key: {}", key.into()))
    }

    /// Create a too large error
    pub fn too_large(what: &str, size: usize, max: usize) -> Self {
        Self::new(RepoErrorKind::TooLarge, None)
            .with_context(format!("{} is {}, max {}", what, size, max))
    }

    /// Create a CAR file error
    pub fn car(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Car, Some(Box::new(source)))
    }

    /// Create a CAR parse error
    pub fn car_parse(source: impl Error + Send + Sync + 'static) -> Self {
        Self::car(source).with_context("Failed to parse CAR file".to_string())
    }

    /// Create an I/O error
    pub fn io(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Io, Some(Box::new(source)))
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;

        if let Some(ctx) = &self.context {
            write!(f, ": {}", ctx)?;
        }

        if let Some(src) = &self.source {
            write!(f, ": {}", src)?;
        }

        Ok(())
    }
}

// Internal granular errors

/// MST-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum MstError {
    /// Empty key not allowed
    #[error("Empty key not allowed")]
    EmptyKey,

    /// Key too long
    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong {
        /// Actual key length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Invalid key characters
    #[error("Invalid key characters: {key}")]
    InvalidKeyChars {
        /// The invalid key
        key: String,
    },

    /// Key is not of the form `<collection>/<record-key>`
    #[error("Key must have exactly one '/' separating non-empty parts: {key}")]
    InvalidKeyShape {
        /// The invalid key
        key: String,
    },

    /// Node structure invalid
    #[error("Node structure invalid: {0}")]
    InvalidNode(String),

    /// Create targeted a key that is already present
    #[error("Key already exists: {key}")]
    KeyExists {
        /// The existing key
        key: String,
    },

    /// Update or delete targeted a key that is not present
    #[error("Key not present: {key}")]
    KeyMissing {
        /// The missing key
        key: String,
    },

    /// Current value did not match the caller's expectation
    #[error("Value for {key} is {actual:?}, expected {expected:?}")]
    PrevMismatch {
        /// Key being written
        key: String,
        /// CID the caller expected
        expected: Option<IpldCid>,
        /// CID actually stored
        actual: Option<IpldCid>,
    },
}

impl From<MstError> for RepoError {
    fn from(e: MstError) -> Self {
        match e {
            MstError::EmptyKey => RepoError::invalid_key(""),
            MstError::KeyTooLong { len, max } => {
                RepoError::invalid_key(format!("length {}/{}", len, max))
            }
            MstError::InvalidKeyChars { key } => RepoError::invalid_key(key),
            MstError::InvalidKeyShape { key } => RepoError::invalid_key(key),
            MstError::InvalidNode(msg) => RepoError::invalid_mst(msg),
            MstError::KeyExists { .. }
            | MstError::KeyMissing { .. }
            | MstError::PrevMismatch { .. } => {
                RepoError::new(RepoErrorKind::InvalidWrite, Some(Box::new(e)))
                    .with_help("the whole batch was rejected; no changes were made")
            }
        }
    }
}

/// Commit-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CommitError {
    /// Invalid commit version
    #[error("Invalid commit version: {0}")]
    InvalidVersion(i64),

    /// Invalid signature format
    #[error("Invalid signature format: {0}")]
    InvalidSignature(String),

    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Unsupported key type
    #[error("Unsupported key type: {0:#x}")]
    UnsupportedKeyType(u64),

    /// Revision did not advance
    #[error("Commit rev {rev} is not after current rev {current}")]
    RevNotIncreasing {
        /// Rev of the rejected commit
        rev: String,
        /// Rev of the current head
        current: String,
    },

    /// Commit is for a different repository
    #[error("DID mismatch: commit has {commit_did}, expected {expected_did}")]
    DidMismatch {
        /// DID in the commit
        commit_did: String,
        /// Expected DID
        expected_did: String,
    },

    /// Serialization failed
    #[error("Serialization failed")]
    Serialization(#[source] BoxError),
}

impl From<CommitError> for RepoError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::InvalidVersion(v) => {
                RepoError::invalid_commit(format!("unsupported version {}", v))
            }
            CommitError::InvalidSignature(_) | CommitError::SignatureVerificationFailed => {
                RepoError::new(RepoErrorKind::InvalidSignature, Some(Box::new(e)))
            }
            CommitError::InvalidKey(_) | CommitError::UnsupportedKeyType(_) => {
                RepoError::new(RepoErrorKind::InvalidSignature, Some(Box::new(e)))
                    .with_context("verifying key unusable".to_string())
            }
            CommitError::RevNotIncreasing { .. } | CommitError::DidMismatch { .. } => {
                RepoError::new(RepoErrorKind::InvalidCommit, Some(Box::new(e)))
            }
            CommitError::Serialization(e) => RepoError::new(RepoErrorKind::MalformedEncoding, Some(e)),
        }
    }
}

/// Sync payload verification errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum SyncError {
    /// CAR file has no root CID
    #[error("CAR file has no root CID")]
    #[diagnostic(
        code(sync::no_root),
        help("sync payloads must have exactly one root CID pointing to the commit")
    )]
    NoRoot,

    /// Commit block not found in CAR
    #[error("Commit block not found in CAR: {cid}")]
    #[diagnostic(
        code(sync::commit_not_found),
        help("the CAR root CID must point to a commit block contained in the CAR")
    )]
    CommitNotFound {
        /// The root CID
        cid: IpldCid,
    },

    /// Record proof did not match the expected value
    #[error("Proof for {key} does not match: expected {expected:?}, found {found:?}")]
    #[diagnostic(code(sync::proof_mismatch))]
    ProofMismatch {
        /// Record key
        key: String,
        /// Expected record CID
        expected: Option<IpldCid>,
        /// Record CID the proof resolves to
        found: Option<IpldCid>,
    },
}

impl From<SyncError> for RepoError {
    fn from(e: SyncError) -> Self {
        match &e {
            SyncError::NoRoot => RepoError::new(RepoErrorKind::Car, Some(Box::new(e))),
            SyncError::CommitNotFound { cid } => {
                RepoError::incomplete(cid, vec![*cid]).with_help(e.to_string())
            }
            SyncError::ProofMismatch { .. } => {
                RepoError::new(RepoErrorKind::InvalidCommit, Some(Box::new(e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy() {
        let cid = IpldCid::default();
        assert!(RepoError::block_not_found("MST node", &cid).is_retryable());
        assert!(RepoError::busy().is_retryable());
        assert!(!RepoError::incomplete(&cid, vec![cid]).is_retryable());
        assert!(!RepoError::cid_mismatch(&cid, &cid).is_retryable());
        assert!(!RepoError::from(CommitError::SignatureVerificationFailed).is_retryable());
    }

    #[test]
    fn missing_cids_are_reported() {
        let cid = IpldCid::default();
        let err = RepoError::block_not_found("record", &cid);
        assert_eq!(err.kind(), &RepoErrorKind::NotFound);
        assert_eq!(err.missing_cids(), &[cid]);

        let err = RepoError::incomplete(&cid, vec![cid, cid]);
        assert_eq!(err.kind(), &RepoErrorKind::IncompleteRepo);
        assert_eq!(err.missing_cids().len(), 2);
    }

    #[test]
    fn commit_errors_map_to_kinds() {
        let err: RepoError = CommitError::SignatureVerificationFailed.into();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidSignature);

        let err: RepoError = CommitError::RevNotIncreasing {
            rev: "a".into(),
            current: "b".into(),
        }
        .into();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidCommit);
    }
}
