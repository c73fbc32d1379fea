//! Content hashing for cache keys.
//!
//! Texts are keyed by the lowercase hex SHA-256 of their exact bytes. No trimming or
//! case folding is applied, so `"Rust"` and `"rust "` are different entries.

/// Length in characters of a [`content_hash`] result.
pub const HASH_LEN: usize = 64;

/// Deterministic 256-bit digest of `text`, hex encoded.
///
/// # Examples
/// ```rust
/// use embedding_cache::hasher::content_hash;
///
/// let h = content_hash("cloud architecture");
/// assert_eq!(h.len(), 64);
/// assert_eq!(h, content_hash("cloud architecture"));
/// ```
pub fn content_hash(text: &str) -> String {
    sha256::digest(text)
}
