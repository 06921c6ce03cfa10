//! Commit structures, signing and signature verification
//!
//! A commit binds a repository DID to an MST root and a revision. It is
//! stored as an ordinary DAG-CBOR block and identified by its CID.

pub mod ops;
pub(crate) mod serde_bytes_helper;

use arbor_common::crypto::{KeyCodec, PublicKey};
use arbor_common::{Did, Ticker, Tid};
use bytes::Bytes;
use cid::Cid as IpldCid;

use crate::codec;
use crate::error::{CommitError, RepoError, Result};

pub use ops::{RepoOp, WriteAction};

/// Commit format version written by this crate
pub const COMMIT_VERSION: i64 = 3;

/// Repository commit object
///
/// `prev` is always serialized (as null for the first commit). Fields are
/// declared in canonical DAG-CBOR key order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Commit {
    /// Repository DID
    pub did: Did,

    /// Revision TID
    pub rev: Tid,

    /// Signature over the unsigned encoding
    #[serde(with = "serde_bytes_helper")]
    pub sig: Bytes,

    /// MST root CID
    pub data: IpldCid,

    /// Previous commit CID (None for initial commit)
    pub prev: Option<IpldCid>,

    /// Commit version
    pub version: i64,
}

/// The signed portion of a commit: every field except `sig`
#[derive(serde::Serialize)]
struct UnsignedCommit<'a> {
    did: &'a Did,
    rev: &'a Tid,
    data: &'a IpldCid,
    prev: Option<&'a IpldCid>,
    version: i64,
}

impl Commit {
    /// Create new unsigned commit (current version, sig empty)
    pub fn new_unsigned(did: Did, data: IpldCid, rev: Tid, prev: Option<IpldCid>) -> Self {
        Self {
            did,
            rev,
            sig: Bytes::new(),
            data,
            prev,
            version: COMMIT_VERSION,
        }
    }

    /// Sign this commit with a key
    pub fn sign(mut self, key: &impl SigningKey) -> Result<Self> {
        let unsigned = self.unsigned_bytes()?;
        self.sig = key.sign_bytes(&unsigned)?;
        Ok(self)
    }

    /// Get the repository DID
    pub fn did(&self) -> &Did {
        &self.did
    }

    /// Get the MST root CID
    pub fn data(&self) -> &IpldCid {
        &self.data
    }

    /// Get the revision TID
    pub fn rev(&self) -> &Tid {
        &self.rev
    }

    /// Get the previous commit CID
    pub fn prev(&self) -> Option<&IpldCid> {
        self.prev.as_ref()
    }

    /// Get the signature bytes
    pub fn sig(&self) -> &Bytes {
        &self.sig
    }

    /// Canonical encoding of the commit with `sig` omitted
    ///
    /// These are the bytes that get signed and verified.
    pub fn unsigned_bytes(&self) -> Result<Vec<u8>> {
        let unsigned = UnsignedCommit {
            did: &self.did,
            rev: &self.rev,
            data: &self.data,
            prev: self.prev.as_ref(),
            version: self.version,
        };
        serde_ipld_dagcbor::to_vec(&unsigned)
            .map_err(|e| CommitError::Serialization(Box::new(e)).into())
    }

    /// Serialize to DAG-CBOR
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        serde_ipld_dagcbor::to_vec(self).map_err(|e| CommitError::Serialization(Box::new(e)).into())
    }

    /// Deserialize from DAG-CBOR
    ///
    /// Only the current commit version is accepted.
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        let commit: Commit = serde_ipld_dagcbor::from_slice(data)
            .map_err(|e| RepoError::from(CommitError::Serialization(Box::new(e))))?;
        commit.check_version()?;
        Ok(commit)
    }

    /// Deserialize from DAG-CBOR, rejecting bytes that are not the canonical encoding
    pub fn from_canonical_cbor(data: &[u8]) -> Result<Self> {
        let commit: Commit = codec::decode_canonical(data)?;
        commit.check_version()?;
        Ok(commit)
    }

    fn check_version(&self) -> Result<()> {
        if self.version != COMMIT_VERSION {
            return Err(CommitError::InvalidVersion(self.version).into());
        }
        Ok(())
    }

    /// Compute CID of this commit
    pub fn to_cid(&self) -> Result<IpldCid> {
        let cbor = self.to_cbor()?;
        codec::compute_cid(&cbor)
    }

    /// Encode and compute the CID in one pass
    pub fn to_block(&self) -> Result<(IpldCid, Bytes)> {
        let cbor = self.to_cbor()?;
        Ok((codec::compute_cid(&cbor)?, Bytes::from(cbor)))
    }

    /// Verify signature against a public key from a DID document.
    ///
    /// The key type is inferred from the PublicKey codec.
    pub fn verify(&self, pubkey: &PublicKey) -> std::result::Result<(), CommitError> {
        let unsigned = self
            .unsigned_bytes()
            .map_err(|e| CommitError::Serialization(e.into()))?;
        let signature = self.sig();

        match pubkey.codec {
            KeyCodec::Ed25519 => {
                let vk = pubkey
                    .to_ed25519()
                    .map_err(|e| CommitError::InvalidKey(e.to_string()))?;
                let sig = ed25519_dalek::Signature::from_slice(signature.as_ref())
                    .map_err(|e| CommitError::InvalidSignature(e.to_string()))?;
                vk.verify_strict(&unsigned, &sig)
                    .map_err(|_| CommitError::SignatureVerificationFailed)?;
            }
            KeyCodec::Secp256k1 => {
                use k256::ecdsa::{Signature, VerifyingKey, signature::Verifier};
                let vk = pubkey
                    .to_k256()
                    .map_err(|e| CommitError::InvalidKey(e.to_string()))?;
                let verifying_key = VerifyingKey::from(&vk);
                let sig = Signature::from_slice(signature.as_ref())
                    .map_err(|e| CommitError::InvalidSignature(e.to_string()))?;
                verifying_key
                    .verify(&unsigned, &sig)
                    .map_err(|_| CommitError::SignatureVerificationFailed)?;
            }
            KeyCodec::P256 => {
                use p256::ecdsa::{Signature, VerifyingKey, signature::Verifier};
                let vk = pubkey
                    .to_p256()
                    .map_err(|e| CommitError::InvalidKey(e.to_string()))?;
                let verifying_key = VerifyingKey::from(&vk);
                let sig = Signature::from_slice(signature.as_ref())
                    .map_err(|e| CommitError::InvalidSignature(e.to_string()))?;
                verifying_key
                    .verify(&unsigned, &sig)
                    .map_err(|_| CommitError::SignatureVerificationFailed)?;
            }
            KeyCodec::Unknown(code) => {
                return Err(CommitError::UnsupportedKeyType(code));
            }
        }

        Ok(())
    }
}

/// Check a commit's signature
pub fn verify_commit(commit: &Commit, pubkey: &PublicKey) -> bool {
    commit.verify(pubkey).is_ok()
}

/// Decode an encoded commit and check its signature
///
/// Bytes that do not decode to a canonical commit never verify.
pub fn verify_commit_bytes(bytes: &[u8], pubkey: &PublicKey) -> bool {
    match Commit::from_canonical_cbor(bytes) {
        Ok(commit) => verify_commit(&commit, pubkey),
        Err(_) => false,
    }
}

/// Trait for signing keys.
///
/// Implemented for ed25519_dalek::SigningKey, k256::ecdsa::SigningKey, and p256::ecdsa::SigningKey.
pub trait SigningKey {
    /// Sign the given data and return signature as Bytes
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes>;

    /// Get the public key bytes
    fn public_key(&self) -> Vec<u8>;

    /// Multicodec of the key type
    fn codec(&self) -> KeyCodec;

    /// Public key in Multikey form, for verification
    fn verifying_key(&self) -> Result<PublicKey> {
        PublicKey::new(self.codec(), self.public_key()).map_err(RepoError::signing)
    }
}

impl SigningKey for ed25519_dalek::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use ed25519_dalek::Signer;
        let sig = Signer::sign(self, data);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> Vec<u8> {
        self.verifying_key().to_bytes().to_vec()
    }

    fn codec(&self) -> KeyCodec {
        KeyCodec::Ed25519
    }
}

impl SigningKey for k256::ecdsa::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use k256::ecdsa::signature::Signer;
        let sig: k256::ecdsa::Signature = Signer::sign(self, data);
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> Vec<u8> {
        self.verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    fn codec(&self) -> KeyCodec {
        KeyCodec::Secp256k1
    }
}

impl SigningKey for p256::ecdsa::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use p256::ecdsa::signature::Signer;
        let sig: p256::ecdsa::Signature = Signer::sign(self, data);
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> Vec<u8> {
        self.verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    fn codec(&self) -> KeyCodec {
        KeyCodec::P256
    }
}

/// Signing capability handed to the commit builder
///
/// Key custody lives outside this crate: an implementation may hold a key in
/// memory, call out to an HSM, or refuse. A refusal is a
/// [`Signing`](crate::RepoErrorKind::Signing) error.
pub trait Signer: Send + Sync {
    /// DID whose repository this signer signs for
    fn did(&self) -> &Did;

    /// Sign the unsigned commit bytes
    fn sign(&self, bytes: &[u8]) -> Result<Bytes>;
}

/// [`Signer`] backed by an in-process key
#[derive(Debug, Clone)]
pub struct KeyedSigner<K> {
    did: Did,
    key: K,
}

impl<K: SigningKey> KeyedSigner<K> {
    /// Pair a DID with the key that signs its repository
    pub fn new(did: Did, key: K) -> Self {
        Self { did, key }
    }

    /// The wrapped key
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Public key in Multikey form
    pub fn verifying_key(&self) -> Result<PublicKey> {
        self.key.verifying_key()
    }
}

impl<K: SigningKey + Send + Sync> Signer for KeyedSigner<K> {
    fn did(&self) -> &Did {
        &self.did
    }

    fn sign(&self, bytes: &[u8]) -> Result<Bytes> {
        self.key.sign_bytes(bytes)
    }
}

/// Build and sign a commit over `data`
///
/// The rev is strictly greater than `prev`'s rev (when given) and than every
/// rev `ticker` has issued. The previous commit must belong to the same DID.
pub fn build_commit(
    did: &Did,
    data: IpldCid,
    prev: Option<(IpldCid, &Commit)>,
    signer: &dyn Signer,
    ticker: &mut Ticker,
) -> Result<Commit> {
    if signer.did() != did {
        return Err(RepoError::signing(format!(
            "signer is for {}, not {}",
            signer.did(),
            did
        )));
    }
    if let Some((_, prev_commit)) = prev {
        if prev_commit.did() != did {
            return Err(CommitError::DidMismatch {
                commit_did: prev_commit.did().to_string(),
                expected_did: did.to_string(),
            }
            .into());
        }
    }

    let rev = ticker
        .next(prev.map(|(_, c)| c.rev()))
        .ok_or_else(|| RepoError::invalid_commit("rev timestamps exhausted"))?;
    let mut commit = Commit::new_unsigned(did.clone(), data, rev, prev.map(|(cid, _)| cid));
    let unsigned = commit.unsigned_bytes()?;
    commit.sig = signer.sign(&unsigned)?;
    Ok(commit)
}
