//! Canonical DAG-CBOR encoding and CID derivation
//!
//! Every hash in a repository is `sha2-256(dag-cbor(value))` wrapped as a CIDv1.
//! `serde_ipld_dagcbor` produces the canonical form: map keys are sorted
//! length-first then bytewise, integers use the shortest encoding, and
//! indefinite-length items are never emitted. Decoding is the left inverse.

use bytes::Bytes;
use cid::Cid as IpldCid;
use ipld_core::ipld::Ipld;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use arbor_common::crypto::{DAG_CBOR, SHA2_256};

use crate::error::{RepoError, Result};

/// Opaque record value (the IPLD data model)
pub type Value = Ipld;

/// Compute CID from raw bytes
///
/// Uses SHA-256 hash and DAG-CBOR codec. Assumes data is already DAG-CBOR encoded.
pub fn compute_cid(data: &[u8]) -> Result<IpldCid> {
    cid_with_codec(DAG_CBOR, data)
}

fn cid_with_codec(codec: u64, data: &[u8]) -> Result<IpldCid> {
    let hash = Sha256::digest(data);
    let mh = multihash::Multihash::<64>::wrap(SHA2_256, hash.as_slice())
        .map_err(RepoError::malformed)?;
    Ok(IpldCid::new_v1(codec, mh))
}

/// Encode a value to canonical DAG-CBOR
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_ipld_dagcbor::to_vec(value).map_err(RepoError::malformed)
}

/// Decode DAG-CBOR bytes
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_ipld_dagcbor::from_slice(bytes).map_err(RepoError::malformed)
}

/// Decode DAG-CBOR bytes, rejecting any encoding that is not canonical.
///
/// The decoded value is re-encoded and must reproduce the input exactly,
/// otherwise two parties could hash the same logical value differently.
pub fn decode_canonical<T: DeserializeOwned + Serialize>(bytes: &[u8]) -> Result<T> {
    let value: T = decode(bytes)?;
    let reencoded = encode(&value)?;
    if reencoded != bytes {
        return Err(RepoError::new(crate::error::RepoErrorKind::MalformedEncoding, None)
            .with_context("block is not canonical DAG-CBOR".to_string()));
    }
    Ok(value)
}

/// Encode a value and compute its CID
pub fn cid_for<T: Serialize + ?Sized>(value: &T) -> Result<(IpldCid, Bytes)> {
    let bytes = encode(value)?;
    let cid = compute_cid(&bytes)?;
    Ok((cid, Bytes::from(bytes)))
}

/// Check that `bytes` hash to `cid`.
///
/// Any mismatch is reported as malformed encoding: the block is corrupt or
/// was substituted.
pub fn verify_block(cid: &IpldCid, bytes: &[u8]) -> Result<()> {
    if cid.hash().code() != SHA2_256 {
        return Err(RepoError::new(crate::error::RepoErrorKind::MalformedEncoding, None)
            .with_context(format!(
                "unsupported multihash {:#x} in {}",
                cid.hash().code(),
                cid
            )));
    }
    let actual = cid_with_codec(cid.codec(), bytes)?;
    if actual.hash() != cid.hash() {
        return Err(RepoError::cid_mismatch(cid, &actual));
    }
    Ok(())
}

/// Validate that a record value only uses the deterministic subset of the data model.
///
/// Floats are rejected: their encodings are not stable across producers.
pub fn check_value(value: &Value) -> Result<()> {
    match value {
        Ipld::Float(_) => Err(RepoError::invalid_write(
            "record values may not contain floating point numbers",
        )),
        Ipld::List(items) => items.iter().try_for_each(check_value),
        Ipld::Map(map) => map.values().try_for_each(check_value),
        _ => Ok(()),
    }
}

/// Encode a record value after validating it
pub fn encode_record(value: &Value) -> Result<(IpldCid, Bytes)> {
    check_value(value)?;
    cid_for(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(text: &str) -> Value {
        let mut map = BTreeMap::new();
        map.insert("text".to_string(), Ipld::String(text.to_string()));
        map.insert("$type".to_string(), Ipld::String("app.test.post".to_string()));
        map.insert("count".to_string(), Ipld::Integer(3));
        Ipld::Map(map)
    }

    #[test]
    fn encode_is_deterministic() {
        let a = encode(&record("hello")).unwrap();
        let b = encode(&record("hello")).unwrap();
        assert_eq!(a, b);
        assert_eq!(compute_cid(&a).unwrap(), compute_cid(&b).unwrap());
    }

    #[test]
    fn map_keys_are_sorted_length_first() {
        let mut map = BTreeMap::new();
        map.insert("bb".to_string(), Ipld::Integer(2));
        map.insert("c".to_string(), Ipld::Integer(1));
        let bytes = encode(&Ipld::Map(map)).unwrap();
        // {"c": 1, "bb": 2}
        assert_eq!(bytes, vec![0xa2, 0x61, b'c', 0x01, 0x62, b'b', b'b', 0x02]);
    }

    #[test]
    fn decode_is_left_inverse() {
        let value = record("roundtrip");
        let bytes = encode(&value).unwrap();
        let back: Value = decode(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn cid_uses_dag_cbor_and_sha256() {
        let (cid, bytes) = cid_for(&record("x")).unwrap();
        assert_eq!(cid.version(), cid::Version::V1);
        assert_eq!(cid.codec(), DAG_CBOR);
        assert_eq!(cid.hash().code(), SHA2_256);
        assert_eq!(cid.hash().digest(), Sha256::digest(&bytes).as_slice());
    }

    #[test]
    fn verify_block_detects_tampering() {
        let (cid, bytes) = cid_for(&record("original")).unwrap();
        verify_block(&cid, &bytes).unwrap();

        let mut tampered = bytes.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        let err = verify_block(&cid, &tampered).unwrap_err();
        assert_eq!(err.kind(), &crate::RepoErrorKind::MalformedEncoding);
    }

    #[test]
    fn non_canonical_is_rejected() {
        // {"a": 1} with the integer in a needlessly wide encoding (0x18 0x01)
        let wide = [0xa1, 0x61, 0x61, 0x18, 0x01];
        assert!(decode::<Value>(&wide).is_err() || decode_canonical::<Value>(&wide).is_err());

        let canonical = encode(&record("ok")).unwrap();
        assert!(decode_canonical::<Value>(&canonical).is_ok());
    }

    #[test]
    fn floats_are_rejected_in_records() {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), Ipld::Float(1.5));
        let err = encode_record(&Ipld::Map(map)).unwrap_err();
        assert_eq!(err.kind(), &crate::RepoErrorKind::InvalidWrite);
    }
}
