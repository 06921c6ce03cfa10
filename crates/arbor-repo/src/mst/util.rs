//! MST key helpers

use crate::error::{MstError, Result};
use sha2::{Digest, Sha256};

/// Maximum length of an MST key in bytes
pub const MAX_KEY_LEN: usize = 1024;

/// Calculate layer (depth) for a key based on its hash
///
/// depth = floor(leading_zero_bits(sha256(key)) / 2), giving an expected
/// fanout of 4. The result depends on nothing but the key.
pub fn layer_for_key(key: &str) -> usize {
    let hash = Sha256::digest(key.as_bytes());
    leading_zeros(&hash) / 2
}

/// Count leading zero bits in hash
fn leading_zeros(hash: &[u8]) -> usize {
    let mut count = 0;
    for byte in hash {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros() as usize;
            break;
        }
    }
    count
}

fn is_valid_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '~' | '-')
}

/// Validate MST key format
///
/// Keys are `<collection>/<record-key>`: exactly one `/` with a non-empty
/// part on each side, both parts drawn from `[a-zA-Z0-9._:~-]`, at most
/// [`MAX_KEY_LEN`] bytes overall.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(MstError::EmptyKey.into());
    }

    if key.len() > MAX_KEY_LEN {
        return Err(MstError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        }
        .into());
    }

    let Some((collection, rkey)) = key.split_once('/') else {
        return Err(MstError::InvalidKeyShape {
            key: key.to_string(),
        }
        .into());
    };
    if collection.is_empty() || rkey.is_empty() || rkey.contains('/') {
        return Err(MstError::InvalidKeyShape {
            key: key.to_string(),
        }
        .into());
    }

    if !collection.chars().all(is_valid_char) || !rkey.chars().all(is_valid_char) {
        return Err(MstError::InvalidKeyChars {
            key: key.to_string(),
        }
        .into());
    }

    Ok(())
}

/// Count shared prefix length in bytes between two keys
pub fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RepoErrorKind;

    #[test]
    fn test_validate_key_valid() {
        assert!(validate_key("app.bsky.feed.post/abc123").is_ok());
        assert!(validate_key("foo.bar/test-key_2024").is_ok());
        assert!(validate_key("a/b").is_ok());
        assert!(validate_key("col/self:~.-_").is_ok());
    }

    #[test]
    fn test_validate_key_shape() {
        for bad in ["", "nocollection", "/rkey", "col/", "a/b/c", "/"] {
            let err = validate_key(bad).unwrap_err();
            assert_eq!(err.kind(), &RepoErrorKind::InvalidKey, "{bad:?}");
        }
    }

    #[test]
    fn test_validate_key_too_long() {
        let long_key = format!("col/{}", "a".repeat(MAX_KEY_LEN));
        assert!(validate_key(&long_key).is_err());

        let max_key = format!("col/{}", "a".repeat(MAX_KEY_LEN - 4));
        assert!(validate_key(&max_key).is_ok());
    }

    #[test]
    fn test_validate_key_invalid_chars() {
        assert!(validate_key("col/key with spaces").is_err());
        assert!(validate_key("col/key@invalid").is_err());
        assert!(validate_key("co#l/key").is_err());
        assert!(validate_key("col/ключ").is_err());
    }

    #[test]
    fn test_common_prefix_len() {
        assert_eq!(common_prefix_len("hello", "help"), 3);
        assert_eq!(common_prefix_len("abc", "abc"), 3);
        assert_eq!(common_prefix_len("abc", "def"), 0);
        assert_eq!(common_prefix_len("", "test"), 0);
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(leading_zeros(&[0, 0, 0, 1]), 31);
        assert_eq!(leading_zeros(&[0xFF, 0, 0]), 0);
        assert_eq!(leading_zeros(&[0, 0x80]), 8);
        assert_eq!(leading_zeros(&[0, 0x01]), 15);
    }

    #[test]
    fn test_layer_for_key_known_values() {
        // fixtures shared with other MST implementations
        assert_eq!(layer_for_key("blue"), 1);
        assert_eq!(layer_for_key("2653ae71"), 0);
        assert_eq!(layer_for_key("88bfafc7"), 2);
        assert_eq!(layer_for_key("2a92d355"), 4);
        assert_eq!(layer_for_key("app.bsky.feed.post/454397e440ec"), 4);
        assert_eq!(layer_for_key("app.bsky.feed.post/9adeb165882c"), 8);
    }
}
