//! CAR (Content Addressable aRchive) file I/O
//!
//! CAR v1 is the transport for repository exports and sync payloads: a header
//! naming the root CID(s) followed by `(CID, bytes)` blocks.
//!
//! # Examples
//!
//! Reading a CAR file:
//! ```ignore
//! use arbor_repo::car::reader::read_car;
//!
//! let parsed = read_car("repo.car").await?;
//! let commit_cid = parsed.root()?;
//! ```
//!
//! Writing a CAR file:
//! ```ignore
//! use arbor_repo::car::writer::write_car;
//!
//! write_car("repo.car", vec![commit_cid], blocks).await?;
//! ```

pub mod reader;
pub mod writer;

pub use reader::{CarBlockStream, ParsedCar, parse_car_bytes, read_car, read_car_header, stream_car};
pub use writer::{export_repo_car, export_repo_car_bytes, write_car, write_car_bytes};
