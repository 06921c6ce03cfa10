//! Multikey public keys and multicodec constants.
//!
//! `PublicKey` decodes a Multikey `publicKeyMultibase` string into raw bytes
//! plus a codec (`KeyCodec`). Feature-gated helpers convert to the verifying
//! key types of ed25519_dalek, k256 and p256.
//!
//! ```
//! use arbor_common::crypto::{PublicKey, KeyCodec};
//! let pk = PublicKey::new(KeyCodec::Ed25519, vec![0u8; 32]).unwrap();
//! let encoded = pk.encode();
//! let decoded = PublicKey::decode(&encoded).unwrap();
//! assert_eq!(decoded, pk);
//! ```

/// SHA2-256 multihash code
pub const SHA2_256: u64 = 0x12;

/// DAG-CBOR multicodec
pub const DAG_CBOR: u64 = 0x71;

/// Raw bytes multicodec
pub const RAW: u64 = 0x55;

/// Known multicodec key codecs for Multikey public keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCodec {
    /// Ed25519
    Ed25519,
    /// Secp256k1
    Secp256k1,
    /// P256
    P256,
    /// Unknown codec
    Unknown(u64),
}

impl KeyCodec {
    /// Multicodec code for this key type
    pub fn code(self) -> u64 {
        match self {
            KeyCodec::Ed25519 => 0xED,
            KeyCodec::Secp256k1 => 0xE7,
            KeyCodec::P256 => 0x1200,
            KeyCodec::Unknown(c) => c,
        }
    }

    fn from_code(code: u64) -> Self {
        match code {
            0xED => KeyCodec::Ed25519,
            0xE7 => KeyCodec::Secp256k1,
            0x1200 => KeyCodec::P256,
            other => KeyCodec::Unknown(other),
        }
    }
}

/// Public key decoded from a Multikey `publicKeyMultibase` string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// Codec used to encode the public key
    pub codec: KeyCodec,
    /// Bytes of the public key (compressed SEC1 for the curves)
    pub bytes: Vec<u8>,
}

/// Errors from decoding or converting Multikey values
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic, PartialEq, Eq)]
pub enum CryptoError {
    /// Multibase decode error
    #[error("failed to decode multibase")]
    MultibaseDecode,
    /// Multicodec decode error
    #[error("failed to decode multicodec varint")]
    MulticodecDecode,
    /// Unsupported key codec error
    #[error("unsupported key codec: {0:#x}")]
    UnsupportedCodec(u64),
    /// Invalid key length error
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidLength {
        /// Expected length of the key
        expected: usize,
        /// Actual length of the key
        got: usize,
    },
    /// Invalid key format error
    #[error("invalid key format")]
    InvalidFormat,
    /// Conversion error
    #[error("conversion error: {0}")]
    Conversion(String),
}

impl PublicKey {
    /// Build a key from a codec and raw bytes, validating the length
    pub fn new(codec: KeyCodec, bytes: impl Into<Vec<u8>>) -> Result<Self, CryptoError> {
        let bytes = bytes.into();
        validate(codec, &bytes)?;
        Ok(Self { codec, bytes })
    }

    /// Decode a Multikey public key from a multibase-encoded string
    pub fn decode(multibase_str: &str) -> Result<Self, CryptoError> {
        let (_base, data) =
            multibase::decode(multibase_str).map_err(|_| CryptoError::MultibaseDecode)?;
        let (code, offset) = decode_uvarint(&data).ok_or(CryptoError::MulticodecDecode)?;
        let codec = KeyCodec::from_code(code);
        let bytes = &data[offset..];
        validate(codec, bytes)?;
        Ok(Self {
            codec,
            bytes: bytes.to_vec(),
        })
    }

    /// Decode from a `did:key:` identifier
    pub fn from_did_key(did: &str) -> Result<Self, CryptoError> {
        let multibase_str = did
            .strip_prefix("did:key:")
            .ok_or(CryptoError::InvalidFormat)?;
        Self::decode(multibase_str)
    }

    /// Encode as a base58btc Multikey string
    pub fn encode(&self) -> String {
        let mut buf = encode_uvarint(self.codec.code());
        buf.extend_from_slice(&self.bytes);
        multibase::encode(multibase::Base::Base58Btc, buf)
    }

    /// Render as a `did:key:` identifier
    pub fn did_key(&self) -> String {
        format!("did:key:{}", self.encode())
    }

    /// Convert to ed25519_dalek verifying key
    #[cfg(feature = "crypto-ed25519")]
    pub fn to_ed25519(&self) -> Result<ed25519_dalek::VerifyingKey, CryptoError> {
        if self.codec != KeyCodec::Ed25519 {
            return Err(CryptoError::UnsupportedCodec(self.codec.code()));
        }
        let bytes: &[u8; 32] =
            self.bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    expected: 32,
                    got: self.bytes.len(),
                })?;
        ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|e| CryptoError::Conversion(e.to_string()))
    }

    /// Convert to k256 public key
    #[cfg(feature = "crypto-k256")]
    pub fn to_k256(&self) -> Result<k256::PublicKey, CryptoError> {
        if self.codec != KeyCodec::Secp256k1 {
            return Err(CryptoError::UnsupportedCodec(self.codec.code()));
        }
        k256::PublicKey::from_sec1_bytes(&self.bytes)
            .map_err(|e| CryptoError::Conversion(e.to_string()))
    }

    /// Convert to p256 public key
    #[cfg(feature = "crypto-p256")]
    pub fn to_p256(&self) -> Result<p256::PublicKey, CryptoError> {
        if self.codec != KeyCodec::P256 {
            return Err(CryptoError::UnsupportedCodec(self.codec.code()));
        }
        p256::PublicKey::from_sec1_bytes(&self.bytes)
            .map_err(|e| CryptoError::Conversion(e.to_string()))
    }
}

fn validate(codec: KeyCodec, bytes: &[u8]) -> Result<(), CryptoError> {
    match codec {
        KeyCodec::Ed25519 => {
            if bytes.len() != 32 {
                return Err(CryptoError::InvalidLength {
                    expected: 32,
                    got: bytes.len(),
                });
            }
        }
        KeyCodec::Secp256k1 | KeyCodec::P256 => {
            if !(bytes.len() == 33 || bytes.len() == 65) {
                return Err(CryptoError::InvalidLength {
                    expected: 33,
                    got: bytes.len(),
                });
            }
            // 0x02/0x03 compressed, 0x04 uncompressed
            let first = *bytes.first().ok_or(CryptoError::InvalidFormat)?;
            if first != 0x02 && first != 0x03 && first != 0x04 {
                return Err(CryptoError::InvalidFormat);
            }
        }
        KeyCodec::Unknown(code) => return Err(CryptoError::UnsupportedCodec(code)),
    }
    Ok(())
}

fn encode_uvarint(mut x: u64) -> Vec<u8> {
    let mut out = Vec::new();
    while x >= 0x80 {
        out.push(((x as u8) & 0x7F) | 0x80);
        x >>= 7;
    }
    out.push(x as u8);
    out
}

fn decode_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for (i, b) in data.iter().copied().enumerate() {
        if b < 0x80 {
            if i > 9 || (i == 9 && b > 1) {
                return None;
            }
            return Some((x | ((b as u64) << s), i + 1));
        }
        x |= ((b & 0x7F) as u64) << s;
        s += 7;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multikey(code: u64, key: &[u8]) -> String {
        let mut buf = encode_uvarint(code);
        buf.extend_from_slice(key);
        multibase::encode(multibase::Base::Base58Btc, buf)
    }

    #[test]
    fn decode_ed25519() {
        let key = [0u8; 32];
        let s = multikey(0xED, &key);
        let pk = PublicKey::decode(&s).expect("decode");
        assert_eq!(pk.codec, KeyCodec::Ed25519);
        assert_eq!(pk.bytes.as_slice(), &key);
    }

    #[test]
    fn decode_k1_compressed() {
        let mut key = [0u8; 33];
        key[0] = 0x02;
        let s = multikey(0xE7, &key);
        let pk = PublicKey::decode(&s).expect("decode");
        assert_eq!(pk.codec, KeyCodec::Secp256k1);
        assert_eq!(pk.bytes.as_slice(), &key);
    }

    #[test]
    fn decode_rejects_unknown_codec() {
        let s = multikey(0x1300, &[1u8; 32]);
        assert_eq!(
            PublicKey::decode(&s),
            Err(CryptoError::UnsupportedCodec(0x1300))
        );
    }

    #[test]
    fn decode_rejects_bad_length() {
        let s = multikey(0xED, &[1u8; 31]);
        assert!(matches!(
            PublicKey::decode(&s),
            Err(CryptoError::InvalidLength { expected: 32, got: 31 })
        ));
    }

    #[test]
    fn varint_roundtrip_two_bytes() {
        let encoded = encode_uvarint(0x1200);
        assert_eq!(encoded, vec![0x80, 0x24]);
        assert_eq!(decode_uvarint(&encoded), Some((0x1200, 2)));
    }

    #[test]
    fn did_key_roundtrip() {
        let mut key = vec![0u8; 33];
        key[0] = 0x03;
        let pk = PublicKey::new(KeyCodec::P256, key).unwrap();
        let did = pk.did_key();
        assert!(did.starts_with("did:key:z"));
        assert_eq!(PublicKey::from_did_key(&did).unwrap(), pk);
    }

    #[cfg(feature = "crypto-ed25519")]
    #[test]
    fn ed25519_conversion() {
        let sk = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let pk = PublicKey::new(KeyCodec::Ed25519, sk.verifying_key().to_bytes().to_vec()).unwrap();
        assert_eq!(pk.to_ed25519().unwrap(), sk.verifying_key());
    }
}
