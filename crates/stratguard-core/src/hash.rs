//! Content hashing for cache keys and integrity checks.
//!
//! Hashes are rendered as `"blake3:<hex>"` so the algorithm is visible in
//! audit records and can be upgraded later.

use serde::{Deserialize, Serialize};
use std::fmt;

const PREFIX: &str = "blake3:";

/// BLAKE3 digest of a strategy's source text (or compiled module bytes).
///
/// Equality via [`PartialEq`] is for map keys. Integrity checks go through
/// [`ContentHash::verify`], which compares in constant time.
///
/// # Examples
///
/// ```
/// use stratguard_core::ContentHash;
///
/// let a = ContentHash::of("x = 1");
/// let b = ContentHash::of("x = 1");
/// assert_eq!(a, b);
/// assert!(a.verify(&b));
/// assert!(a.as_str().starts_with("blake3:"));
/// assert_eq!(a.as_str().len(), 71);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hashes text.
    #[must_use]
    pub fn of(text: &str) -> Self {
        Self::of_bytes(text.as_bytes())
    }

    /// Hashes raw bytes.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("{PREFIX}{}", blake3::hash(bytes).to_hex()))
    }

    /// Rendered digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against another digest.
    #[must_use]
    pub fn verify(&self, other: &Self) -> bool {
        constant_time_compare(&self.0, &other.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compares two strings without short-circuiting on the first mismatch.
///
/// # Examples
///
/// ```
/// use stratguard_core::hash::constant_time_compare;
///
/// assert!(constant_time_compare("blake3:ab", "blake3:ab"));
/// assert!(!constant_time_compare("blake3:ab", "blake3:ac"));
/// assert!(!constant_time_compare("blake3:a", "blake3:ab"));
/// ```
#[must_use]
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    let (lhs, rhs) = (a.as_bytes(), b.as_bytes());
    let mut diff = u8::from(lhs.len() != rhs.len());
    for i in 0..lhs.len().max(rhs.len()) {
        diff |= lhs.get(i).copied().unwrap_or(0) ^ rhs.get(i).copied().unwrap_or(0);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_text_distinct_hash() {
        assert_ne!(ContentHash::of("a"), ContentHash::of("b"));
        assert!(!ContentHash::of("a").verify(&ContentHash::of("b")));
    }

    #[test]
    fn test_text_and_bytes_agree() {
        assert_eq!(ContentHash::of("abc"), ContentHash::of_bytes(b"abc"));
    }

    #[test]
    fn test_empty_strings_compare_equal() {
        assert!(constant_time_compare("", ""));
        assert!(!constant_time_compare("", "x"));
    }

    #[test]
    fn test_hash_is_lowercase_hex() {
        let hash = ContentHash::of("strategy");
        let hex = hash.as_str().trim_start_matches(PREFIX);
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
