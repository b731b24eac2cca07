//! Per-file encryption state and the metadata envelope.
//!
//! Every encrypted file has a random data key (AES-CTR-256) and a
//! metadata key (the volume key paired with a random IV). The envelope
//! stored in object headers is
//!
//! ```text
//! enc-iv:   hex(iv of the metadata key)
//! enc-meta: hex(AES-CBC-256-PKCS(meta_key,
//!               "s3fuse_enc_meta " || hexkey:hexiv || "#" || sha256root))
//! ```
//!
//! The envelope is only trusted when the object is intact (its etag still
//! matches the etag recorded at the last metadata write). A file whose
//! envelope cannot be decrypted stays usable for rename and delete but
//! refuses reads and writes.

use cirrus_core::{Error, Result};
use cirrus_crypto::{AesCbc256, AesCtr256, SecretBuffer, SymmetricKey};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::metadata;

/// Mutable key state of one encrypted file.
#[derive(Debug, Default)]
pub(crate) struct CryptoState {
    meta_key: Option<SymmetricKey>,
    data_key: Option<SymmetricKey>,
    enc_iv: String,
    enc_meta: String,
}

/// The encryption half of a file node.
#[derive(Debug, Default)]
pub(crate) struct FileCrypto {
    state: Mutex<CryptoState>,
}

impl FileCrypto {
    /// Whether the data key is available (the file has been unlocked).
    pub fn is_unlocked(&self) -> bool {
        self.state.lock().data_key.is_some()
    }

    /// The data key, or `PermissionDenied` when the file is locked.
    pub fn data_key(&self) -> Result<SymmetricKey> {
        self.state
            .lock()
            .data_key
            .clone()
            .ok_or(Error::PermissionDenied)
    }

    /// The current envelope headers `(enc_iv, enc_meta)`.
    pub fn envelope(&self) -> (String, String) {
        let state = self.state.lock();
        (state.enc_iv.clone(), state.enc_meta.clone())
    }

    /// Decrypt the stored envelope with the volume key. Returns the
    /// plaintext SHA-256 root recorded inside, if any.
    ///
    /// Failure leaves the file locked but otherwise usable; the caller
    /// decides nothing beyond logging.
    pub fn unlock_from_headers(
        &self,
        path: &str,
        volume_key: Option<&SecretBuffer>,
        enc_iv: &str,
        enc_meta: &str,
    ) -> Option<String> {
        let mut state = self.state.lock();

        state.enc_iv = enc_iv.to_owned();
        state.enc_meta = enc_meta.to_owned();
        state.meta_key = None;
        state.data_key = None;

        if enc_iv.is_empty() || enc_meta.is_empty() {
            debug!(path, "encrypted file has no IV/metadata");
            return None;
        }

        let Some(volume_key) = volume_key else {
            debug!(path, "no volume key available to unlock file");
            return None;
        };

        let iv = match SecretBuffer::from_hex(enc_iv) {
            Ok(iv) => iv,
            Err(error) => {
                warn!(path, %error, "malformed envelope IV");
                return None;
            }
        };

        let meta_key = SymmetricKey::new(volume_key.clone(), iv);

        let plaintext = match AesCbc256::decrypt_from_hex(&meta_key, enc_meta) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                warn!(
                    path,
                    "failed to decrypt file metadata. this probably means the volume key is invalid"
                );
                return None;
            }
        };

        let Some(rest) = plaintext.strip_prefix(metadata::ENVELOPE_VERIFIER) else {
            warn!(path, "file metadata not valid");
            return None;
        };

        let Some((key_string, sha256)) = rest.split_once('#') else {
            warn!(path, "malformed encrypted file metadata");
            return None;
        };

        match SymmetricKey::from_string(key_string) {
            Ok(data_key) => {
                state.meta_key = Some(meta_key);
                state.data_key = Some(data_key);
                Some(sha256.to_owned())
            }
            Err(error) => {
                warn!(path, %error, "malformed data key in envelope");
                None
            }
        }
    }

    /// Generate fresh keys for an upload; the old envelope is dropped so
    /// a failed upload never leaves a stale envelope pointing at new
    /// content.
    pub fn prepare_upload(&self, volume_key: &SecretBuffer) {
        let mut state = self.state.lock();
        state.meta_key = Some(SymmetricKey::generate_iv(
            volume_key.clone(),
            AesCbc256::IV_LEN,
        ));
        state.data_key = Some(SymmetricKey::generate(
            AesCtr256::KEY_LEN,
            AesCtr256::IV_LEN,
        ));
        state.enc_iv.clear();
        state.enc_meta.clear();
    }

    /// Rebuild the envelope after a successful upload.
    ///
    /// # Errors
    ///
    /// [`Error::State`] when called without prepared keys.
    pub fn finalize_upload(&self, sha256: &str) -> Result<()> {
        let mut state = self.state.lock();

        let (Some(meta_key), Some(data_key)) = (&state.meta_key, &state.data_key) else {
            return Err(Error::State("upload finalized without prepared keys"));
        };

        let plaintext = format!(
            "{}{}#{sha256}",
            metadata::ENVELOPE_VERIFIER,
            data_key.to_string()
        );
        let enc_meta = AesCbc256::encrypt_to_hex(meta_key, &plaintext)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let enc_iv = meta_key.iv().to_hex();

        state.enc_iv = enc_iv;
        state.enc_meta = enc_meta;
        Ok(())
    }

    /// CTR-transform a chunk in place at a file offset (encryption and
    /// decryption are the same transform).
    ///
    /// # Errors
    ///
    /// [`Error::PermissionDenied`] when locked; cipher errors for
    /// misaligned offsets.
    pub fn transform_chunk(&self, data: &mut [u8], offset: u64) -> Result<()> {
        let data_key = self.data_key()?;
        AesCtr256::crypt_at_offset(&data_key, offset, data)
            .map_err(|e| Error::Crypto(e.to_string()))
    }
}
