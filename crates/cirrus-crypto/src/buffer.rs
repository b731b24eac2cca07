//! Random secret byte buffers.

use rand::RngCore;

use crate::CryptoError;

/// Owned secret bytes (key or IV material) with hex serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretBuffer {
    bytes: Vec<u8>,
}

impl SecretBuffer {
    /// Generate `len` cryptographically random bytes.
    #[must_use]
    pub fn generate(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// A zero-filled buffer of `len` bytes.
    #[must_use]
    pub fn zero(len: usize) -> Self {
        Self {
            bytes: vec![0u8; len],
        }
    }

    /// Wrap existing bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Parse a hex string.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decode`] for non-hex input.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: crate::hex_decode(s)?,
        })
    }

    /// The raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Buffer length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}
