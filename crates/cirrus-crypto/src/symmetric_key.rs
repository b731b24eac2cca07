//! Symmetric key material: a key plus an initialization vector.

use crate::{CryptoError, SecretBuffer};

/// A `(key, iv)` pair, serialized as `hexkey:hexiv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    key: SecretBuffer,
    iv: SecretBuffer,
}

impl SymmetricKey {
    /// Pair an existing key with an existing IV.
    #[must_use]
    pub fn new(key: SecretBuffer, iv: SecretBuffer) -> Self {
        Self { key, iv }
    }

    /// Generate fresh random key and IV of the given lengths.
    #[must_use]
    pub fn generate(key_len: usize, iv_len: usize) -> Self {
        Self {
            key: SecretBuffer::generate(key_len),
            iv: SecretBuffer::generate(iv_len),
        }
    }

    /// Pair an existing key with a fresh random IV.
    #[must_use]
    pub fn generate_iv(key: SecretBuffer, iv_len: usize) -> Self {
        Self {
            key,
            iv: SecretBuffer::generate(iv_len),
        }
    }

    /// Parse the `hexkey:hexiv` serialization.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedKey`] when the separator is missing
    /// or either half is not valid hex.
    pub fn from_string(s: &str) -> Result<Self, CryptoError> {
        let (key, iv) = s
            .split_once(':')
            .ok_or_else(|| CryptoError::MalformedKey("missing ':' separator".to_owned()))?;

        Ok(Self {
            key: SecretBuffer::from_hex(key)
                .map_err(|e| CryptoError::MalformedKey(e.to_string()))?,
            iv: SecretBuffer::from_hex(iv)
                .map_err(|e| CryptoError::MalformedKey(e.to_string()))?,
        })
    }

    /// The key bytes.
    #[must_use]
    pub fn key(&self) -> &SecretBuffer {
        &self.key
    }

    /// The IV bytes.
    #[must_use]
    pub fn iv(&self) -> &SecretBuffer {
        &self.iv
    }
}

impl std::fmt::Display for SymmetricKey {
    /// Serializes as `hexkey:hexiv`, the inverse of
    /// [`SymmetricKey::from_string`].
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.key.to_hex(), self.iv.to_hex())
    }
}
