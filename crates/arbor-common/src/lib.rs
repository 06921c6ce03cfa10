//! Identity and primitive types shared across arbor crates
//!
//! - [`Did`]: validated decentralized identifier, the owner of a repository
//! - [`Tid`] / [`Ticker`]: sortable timestamp identifiers used as commit revisions
//! - [`PublicKey`]: Multikey-encoded verifying keys for commit signatures
//! - multicodec constants for CID construction

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod crypto;
/// Decentralized identifiers
pub mod did;
pub mod error;
/// Timestamp identifiers
pub mod tid;

pub use crypto::{CryptoError, KeyCodec, PublicKey};
pub use did::Did;
pub use error::{StrParseError, StrParseKind};
pub use tid::{Ticker, Tid};
