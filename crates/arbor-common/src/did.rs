use crate::error::StrParseError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;
use std::fmt;
use std::sync::LazyLock;
use std::{ops::Deref, str::FromStr};

/// A decentralized identifier (`did:<method>:<identifier>`).
///
/// Repositories are owned by exactly one DID, and every commit carries it.
/// Method-specific resolution is out of scope here; this type only guarantees
/// the string is syntactically valid.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Hash)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Did(SmolStr);

/// Regex for DID syntax validation.
///
/// Allows `%` in the identifier but forbids a trailing `:` or `%`.
pub static DID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").unwrap());

/// Maximum length of a DID in bytes
pub const DID_MAX_LEN: usize = 2048;

impl Did {
    /// Fallible constructor, validates
    pub fn new(did: impl AsRef<str>) -> Result<Self, StrParseError> {
        let did = did.as_ref();
        if did.len() > DID_MAX_LEN {
            Err(StrParseError::too_long("did", did, DID_MAX_LEN, did.len()))
        } else if !DID_REGEX.is_match(did) {
            Err(StrParseError::regex("did", did, "expected did:<method>:<identifier>"))
        } else {
            Ok(Self(SmolStr::new(did)))
        }
    }

    /// Fallible constructor for string literals
    pub fn new_static(did: &'static str) -> Result<Self, StrParseError> {
        if did.len() > DID_MAX_LEN {
            Err(StrParseError::too_long("did", did, DID_MAX_LEN, did.len()))
        } else if !DID_REGEX.is_match(did) {
            Err(StrParseError::regex("did", did, "expected did:<method>:<identifier>"))
        } else {
            Ok(Self(SmolStr::new_static(did)))
        }
    }

    /// The DID method (`plc`, `web`, `key`, ...)
    pub fn method(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or_default()
    }

    /// Everything after `did:<method>:`
    pub fn identifier(&self) -> &str {
        let method_len = self.method().len();
        &self.0[4 + method_len + 1..]
    }

    /// Returns the DID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Did {
    type Err = StrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(&value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}", self.0)
    }
}

impl From<Did> for SmolStr {
    fn from(value: Did) -> Self {
        value.0
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Did {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_dids() {
        assert!(Did::new("did:plc:abc123").is_ok());
        assert!(Did::new("did:web:example.com").is_ok());
        assert!(Did::new("did:web:localhost%3A1234").is_ok());
        assert!(Did::new("did:key:zQ3shokFTS3brHcDQrn82RUDfCZESWL1ZdCEJwekUDPQiYBme").is_ok());
    }

    #[test]
    fn invalid_dids() {
        assert!(Did::new("").is_err());
        assert!(Did::new("did:").is_err());
        assert!(Did::new("did:plc:").is_err());
        assert!(Did::new("did:PLC:abc").is_err());
        assert!(Did::new("did:plc:abc:").is_err());
        assert!(Did::new("did:plc:abc%").is_err());
        assert!(Did::new("plc:abc").is_err());
    }

    #[test]
    fn too_long() {
        let long = format!("did:plc:{}", "a".repeat(DID_MAX_LEN));
        let err = Did::new(&long).unwrap_err();
        assert!(matches!(err.reason, crate::error::StrParseKind::TooLong { .. }));
    }

    #[test]
    fn method_and_identifier() {
        let did = Did::new("did:web:example.com").unwrap();
        assert_eq!(did.method(), "web");
        assert_eq!(did.identifier(), "example.com");
    }

    #[test]
    fn serde_rejects_invalid() {
        let bytes = serde_ipld_dagcbor::to_vec(&"not-a-did").unwrap();
        assert!(serde_ipld_dagcbor::from_slice::<Did>(&bytes).is_err());

        let did = Did::new("did:plc:abc123").unwrap();
        let bytes = serde_ipld_dagcbor::to_vec(&did).unwrap();
        let back: Did = serde_ipld_dagcbor::from_slice(&bytes).unwrap();
        assert_eq!(back, did);
    }
}
