//! Hash helpers – abstraction so the algorithm can change without touching
//! the rest of the pipeline.
//!
//! SHA-256 is used throughout. The digest is wrapped in these functions so
//! `sha2::Sha256` doesn't leak across the other crates.

use crate::constants::KEY_LENGTH_HEX_CHARS;
use crate::hashing::to_canonical_json;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hashes a string and returns the full hex digest (64 chars).
pub fn hash_str(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    encode_hex(&hasher.finalize())
}

/// Hashes raw bytes (used for an archive's `file_hash`).
pub fn hash_bytes(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    encode_hex(&hasher.finalize())
}

/// Hashes a JSON Value after canonicalizing it first.
pub fn hash_value(v: &Value) -> String {
    let canonical = to_canonical_json(v);
    hash_str(&canonical)
}

/// Derives a document primary key from a canonical string already built by
/// the caller (see the `*_key` helpers in `pipeline-domain`).
///
/// `key = hex(sha256(canonical_input))[:16]`. The 16 hex char (64-bit)
/// prefix avoids practical collisions within a collection while keeping
/// keys readable in logs.
pub fn derive_key(canonical_input: &str) -> String {
    let full = hash_str(canonical_input);
    full[..KEY_LENGTH_HEX_CHARS].to_string()
}

fn encode_hex(bytes: impl AsRef<[u8]>) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.as_ref().len() * 2);
    for b in bytes.as_ref() {
        write!(&mut s, "{:02x}", b).expect("write to String never fails");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_str_is_deterministic_and_64_hex_chars() {
        let a = hash_str("hello");
        let b = hash_str("hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn derive_key_is_16_hex_chars_and_deterministic() {
        let k1 = derive_key("s1|abcdef");
        let k2 = derive_key("s1|abcdef");
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), KEY_LENGTH_HEX_CHARS);
        assert!(k1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn derive_key_differs_for_different_inputs() {
        assert_ne!(derive_key("a"), derive_key("b"));
    }

    #[test]
    fn hash_value_is_stable_regardless_of_object_key_order() {
        let a: Value = serde_json::json!({"b": 1, "a": 2});
        let b: Value = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(hash_value(&a), hash_value(&b));
    }
}
