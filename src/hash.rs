//! Hashing capability.
//!
//! Layers that need content digests (integrity checking, content
//! addressing) consume this narrow record instead of a concrete hash
//! library. The shipped implementation uses BLAKE3.

use std::io::Read;
use std::path::Path;

use crate::error::Result;

/// Digest interface consumed by integrity-oriented layers.
pub trait Hasher: Send + Sync {
    /// Digest length in bytes.
    fn hash_size(&self) -> usize;

    /// Length of the hex rendering, excluding any terminator.
    fn hex_size(&self) -> usize {
        self.hash_size() * 2
    }

    /// Digest of an in-memory buffer.
    fn hash_buffer(&self, buf: &[u8]) -> Vec<u8>;

    /// Hex-encoded digest of an in-memory buffer.
    fn hash_buffer_hex(&self, buf: &[u8]) -> String {
        hex::encode(self.hash_buffer(buf))
    }

    /// Digest of a file's entire contents.
    fn hash_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Hex-encoded digest of a file's entire contents.
    fn hash_file_hex(&self, path: &Path) -> Result<String> {
        Ok(hex::encode(self.hash_file(path)?))
    }
}

/// BLAKE3 [`Hasher`].
#[derive(Debug, Default)]
pub struct Blake3Hasher;

impl Hasher for Blake3Hasher {
    fn hash_size(&self) -> usize {
        blake3::OUT_LEN
    }

    fn hash_buffer(&self, buf: &[u8]) -> Vec<u8> {
        blake3::hash(buf).as_bytes().to_vec()
    }

    fn hash_file(&self, path: &Path) -> Result<Vec<u8>> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        let mut chunk = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
        }
        Ok(hasher.finalize().as_bytes().to_vec())
    }
}
