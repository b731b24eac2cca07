//! Filesystem encryption bootstrap: wrap-key derivation and volume-key
//! unlock.

use std::sync::Arc;

use cirrus_core::{Config, Error, Result};
use cirrus_crypto::{
    AesCbc256, SecretBuffer, derive_pbkdf2_sha1, read_password, read_private_file,
};
use cirrus_transport::{Pool, Priority};
use parking_lot::Mutex;
use tracing::debug;

use crate::fs::FsContext;
use crate::volume_key::VolumeKey;

const DERIVATION_ROUNDS: u32 = 8192;
const PASSWORD_ATTEMPTS: u32 = 5;

/// The unlocked encryption context of a mount.
pub struct Encryption {
    volume_key: SecretBuffer,
}

impl std::fmt::Debug for Encryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryption").finish_non_exhaustive()
    }
}

impl Encryption {
    /// Derive the wrap key from a user password (PBKDF2-SHA1, 8192
    /// rounds, salt = bucket name).
    #[must_use]
    pub fn derive_wrap_key(config: &Config, password: &str) -> SecretBuffer {
        derive_pbkdf2_sha1(
            password,
            &config.bucket_name,
            DERIVATION_ROUNDS,
            AesCbc256::KEY_LEN,
        )
    }

    /// Fetch and unlock the configured volume key. The wrap key comes
    /// from the configured private key file, or interactively from the
    /// terminal with a bounded number of attempts.
    ///
    /// # Errors
    ///
    /// A missing key object, exhausted password attempts, or credential
    /// file problems.
    pub fn init(context: &Arc<FsContext>, pool: &Arc<Pool>) -> Result<Option<Arc<Self>>> {
        let config = &context.config;

        if !config.use_encryption {
            return Ok(None);
        }

        if config.volume_key_id.is_empty() {
            return Err(Error::Invalid(
                "volume key id must be set if encryption is enabled".to_owned(),
            ));
        }

        let fetch_context = Arc::clone(context);
        let key_id = config.volume_key_id.clone();
        let slot: Arc<Mutex<Option<VolumeKey>>> = Arc::new(Mutex::new(None));
        let slot_out = Arc::clone(&slot);

        pool.call(
            Priority::PrReq0,
            Box::new(move |request| {
                *slot_out.lock() = VolumeKey::fetch(&fetch_context, request, &key_id)?;
                Ok(())
            }),
        )?;

        let mut key = slot.lock().take().ok_or_else(|| {
            Error::Invalid(
                "encryption enabled but the specified volume key could not be found".to_owned(),
            )
        })?;

        if config.volume_key_file.is_empty() {
            let mut attempts = 0;
            loop {
                let prompt = format!(
                    "password for key \"{}\" in bucket \"{}\": ",
                    config.volume_key_id, config.bucket_name
                );
                let password =
                    read_password(&prompt).map_err(|e| Error::Crypto(e.to_string()))?;

                if password.is_empty() {
                    return Err(Error::Invalid(
                        "cannot use empty password for file encryption".to_owned(),
                    ));
                }

                match key.unlock(&Self::derive_wrap_key(config, &password)) {
                    Ok(()) => break,
                    Err(error) => {
                        attempts += 1;
                        if attempts >= PASSWORD_ATTEMPTS {
                            return Err(error);
                        }
                        eprintln!("incorrect password. please try again.");
                    }
                }
            }
        } else {
            let line = read_private_file(&config.volume_key_file)
                .map_err(|e| Error::Invalid(e.to_string()))?;
            let wrap_key =
                SecretBuffer::from_hex(&line).map_err(|e| Error::Crypto(e.to_string()))?;
            key.unlock(&wrap_key)?;
        }

        debug!(key_id = %config.volume_key_id, "encryption enabled");

        Ok(Some(Arc::new(Self {
            volume_key: key.volume_key()?,
        })))
    }

    /// Build an encryption context from an already unlocked key (tests
    /// and the key-management flow).
    #[must_use]
    pub fn with_volume_key(volume_key: SecretBuffer) -> Arc<Self> {
        Arc::new(Self { volume_key })
    }

    /// The data-encrypting key of this mount.
    #[must_use]
    pub fn volume_key(&self) -> SecretBuffer {
        self.volume_key.clone()
    }
}
