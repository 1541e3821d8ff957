//! Content hashing for cache keys.

use sha2::{Digest, Sha256};

/// SHA256 of a text, truncated to 16 hex characters.
///
/// Cache keys embed hashes of questions and SQL statements; 64 bits of
/// the digest keeps keys short while collisions stay negligible at the
/// cache's scale.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_hash_deterministic() {
        assert_eq!(text_hash("revenue YTD"), text_hash("revenue YTD"));
        assert_eq!(text_hash("revenue YTD").len(), 16);
    }

    #[test]
    fn test_text_hash_distinguishes_inputs() {
        assert_ne!(text_hash("a"), text_hash("b"));
    }
}
