//! SHA-256 digest helpers for the object chunk pipeline.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of a single chunk body.
pub fn chunk_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Incremental digest over an object's full byte stream, fed one chunk
/// at a time as it's written so the whole-object digest never needs the
/// complete body in memory at once.
#[derive(Default)]
pub struct StreamingDigest {
    hasher: Sha256,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self { hasher: Sha256::new() }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_digest_matches_streaming_digest_over_same_bytes() {
        let body = b"the quick brown fox";
        let mut streaming = StreamingDigest::new();
        streaming.update(body);
        assert_eq!(chunk_digest(body), streaming.finalize());
    }

    #[test]
    fn streaming_digest_is_order_sensitive() {
        let mut a = StreamingDigest::new();
        a.update(b"ab");
        a.update(b"cd");

        let mut b = StreamingDigest::new();
        b.update(b"cd");
        b.update(b"ab");

        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn empty_digest_is_stable() {
        assert_eq!(chunk_digest(b""), StreamingDigest::new().finalize());
    }
}
