//! Chunked hash list: a Merkle-style digest over 128 KiB chunks.
//!
//! Transfer code updates disjoint chunk ranges from parallel parts; the
//! root hash is the digest of the concatenated chunk digests. Updates for
//! different parts touch different slots, so a completed list is
//! deterministic regardless of part completion order.

use digest::Digest;
use parking_lot::Mutex;

use crate::CryptoError;

/// Chunk size the list hashes over.
pub const HASH_LIST_CHUNK_SIZE: u64 = 128 * 1024;

const DIGEST_LEN: usize = 32;

/// SHA-256 hash list over 128 KiB chunks.
#[derive(Debug)]
pub struct Sha256HashList {
    hashes: Mutex<Vec<u8>>,
}

impl Sha256HashList {
    /// Create a list sized for `total_size` bytes of data.
    #[must_use]
    pub fn new(total_size: u64) -> Self {
        let chunks = total_size.div_ceil(HASH_LIST_CHUNK_SIZE) as usize;
        Self {
            hashes: Mutex::new(vec![0u8; chunks * DIGEST_LEN]),
        }
    }

    /// Hash `data` into the chunk slots starting at `offset`, which must
    /// be chunk-aligned. `data` may span several chunks; only the final
    /// chunk of the file may be short.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Cipher`] for misaligned offsets.
    pub fn compute_hash(&self, offset: u64, data: &[u8]) -> Result<(), CryptoError> {
        if offset % HASH_LIST_CHUNK_SIZE != 0 {
            return Err(CryptoError::Cipher(
                "cannot compute hash if offset is not chunk-aligned".to_owned(),
            ));
        }

        let chunk_size = HASH_LIST_CHUNK_SIZE as usize;
        let mut hashes = self.hashes.lock();

        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let slot = (offset / HASH_LIST_CHUNK_SIZE) as usize + i;
            let digest: [u8; DIGEST_LEN] = sha2::Sha256::digest(chunk).into();
            hashes[slot * DIGEST_LEN..(slot + 1) * DIGEST_LEN].copy_from_slice(&digest);
        }

        Ok(())
    }

    /// The root hash: SHA-256 over the concatenated chunk digests,
    /// rendered as hex.
    #[must_use]
    pub fn root_hash_hex(&self) -> String {
        let hashes = self.hashes.lock();
        hex::encode(sha2::Sha256::digest(hashes.as_slice()))
    }
}
