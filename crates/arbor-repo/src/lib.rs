//! Signed, content-addressed record repositories
//!
//! This crate provides the building blocks of a personal data repository:
//!
//! - **Codec**: canonical DAG-CBOR encoding and CIDv1 (sha2-256) derivation
//! - **Storage**: pluggable async block stores (memory, CAR file, staging overlay)
//! - **MST (Merkle Search Tree)**: immutable, history-independent key/CID map
//! - **Commits**: signed commit objects chained by revision
//! - **Repository**: the write pipeline that ties the above together
//! - **Diff / sync**: minimal block sets between two trees, CAR export and
//!   verified import
//!
//! Two parties holding the same set of records always compute the same tree
//! root, no matter the order the records were written in.
//!
//! # Example
//!
//! ```rust,ignore
//! use arbor_repo::{MemoryBlockStore, RecordWrite, RepoConfig, Repository};
//! use arbor_repo::commit::KeyedSigner;
//! use std::sync::Arc;
//!
//! let signer = KeyedSigner::new(did, signing_key);
//! let repo = Repository::create(Arc::new(MemoryBlockStore::new()), &signer, RepoConfig::default()).await?;
//!
//! let data = repo
//!     .apply_writes(&[RecordWrite::create("app.example.post", "3jzfcijpj2z2a", value)], &signer)
//!     .await?;
//!
//! // hand data.to_car() to whoever broadcasts commits
//! let replica = Repository::import(Arc::new(MemoryBlockStore::new()), &repo.export().await?, &pubkey, RepoConfig::default()).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

/// CAR (Content Addressable aRchive) utilities
pub mod car;
pub mod codec;
/// Commit structures, signing and verification
pub mod commit;
pub mod config;
pub mod error;
/// Merkle Search Tree implementation
pub mod mst;
pub mod repo;
/// Block storage abstraction
pub mod storage;
pub mod sync;

pub use codec::Value;
pub use commit::{Commit, KeyedSigner, Signer};
pub use config::RepoConfig;
pub use error::{RepoError, RepoErrorKind, Result};
pub use mst::{Mst, MstDiff, WriteOp};
pub use repo::{CommitData, RecordWrite, Repository};
pub use storage::{BlockStore, FileBlockStore, LayeredBlockStore, MemoryBlockStore};
pub use sync::verify_record_proof;

/// DAG-CBOR codec identifier for CIDs (0x71)
pub const DAG_CBOR_CID_CODEC: u64 = 0x71;
