//! In-bucket volume key objects.
//!
//! A volume key is a random data-encrypting key stored in the bucket
//! under the reserved prefix, wrapped with AES-CBC-256-PKCS under a key
//! derived from the user's password. Rotation writes a temp object,
//! copies it over the real one guarded by `copy-source-if-match`, and
//! deletes the temp, so the old key object stays valid unless the new one
//! was durably written.

use std::sync::Arc;

use cirrus_core::{Error, Result};
use cirrus_crypto::{AesCbc256, SecretBuffer, SymmetricKey, base64_decode};
use cirrus_transport::{HttpMethod, Request, status};

use crate::directory::Directory;
use crate::fs::FsContext;
use crate::metadata;
use crate::object::Object;

const VOLUME_KEY_OBJECT_PREFIX: &str = "encryption_vk_";
const VOLUME_KEY_OBJECT_TEMP_PREFIX: &str = "$temp$_";

fn build_url(context: &FsContext, id: &str) -> String {
    Object::build_internal_url(context, &format!("{VOLUME_KEY_OBJECT_PREFIX}{id}"))
}

fn is_temp_id(id: &str) -> bool {
    id.starts_with(VOLUME_KEY_OBJECT_TEMP_PREFIX)
}

/// One bucket volume key.
pub struct VolumeKey {
    context: Arc<FsContext>,
    id: String,
    encrypted_key: Option<String>,
    volume_key: Option<SecretBuffer>,
}

impl std::fmt::Debug for VolumeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeKey")
            .field("id", &self.id)
            .field("present", &self.encrypted_key.is_some())
            .field("unlocked", &self.volume_key.is_some())
            .finish_non_exhaustive()
    }
}

impl VolumeKey {
    /// Fetch the key object `id` from the bucket; `None` when absent.
    ///
    /// # Errors
    ///
    /// Transfer failures other than a clean 404.
    pub fn fetch(
        context: &Arc<FsContext>,
        request: &mut Request,
        id: &str,
    ) -> Result<Option<Self>> {
        let mut key = Self {
            context: Arc::clone(context),
            id: id.to_owned(),
            encrypted_key: None,
            volume_key: None,
        };

        key.download(request)?;

        Ok(key.is_present().then_some(key))
    }

    /// Generate a fresh key under `id`; the id must be unused.
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`] for temp ids, [`Error::Exists`] when the id is
    /// taken.
    pub fn generate(context: &Arc<FsContext>, request: &mut Request, id: &str) -> Result<Self> {
        if is_temp_id(id) {
            return Err(Error::Invalid("invalid key id".to_owned()));
        }

        let mut key = Self {
            context: Arc::clone(context),
            id: id.to_owned(),
            encrypted_key: None,
            volume_key: None,
        };

        key.download(request)?;
        if key.is_present() {
            return Err(Error::Exists);
        }

        key.volume_key = Some(SecretBuffer::generate(AesCbc256::KEY_LEN));
        Ok(key)
    }

    /// All non-temp key ids present in the bucket.
    ///
    /// # Errors
    ///
    /// Listing failures.
    pub fn list_ids(context: &Arc<FsContext>) -> Result<Vec<String>> {
        Ok(Directory::get_internal_objects(context)?
            .into_iter()
            .filter_map(|name| {
                name.strip_prefix(VOLUME_KEY_OBJECT_PREFIX)
                    .filter(|id| !is_temp_id(id))
                    .map(str::to_owned)
            })
            .collect())
    }

    /// The key id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the key object exists in the bucket.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.encrypted_key.is_some()
    }

    /// The unwrapped data-encrypting key.
    ///
    /// # Errors
    ///
    /// [`Error::State`] before a successful unlock.
    pub fn volume_key(&self) -> Result<SecretBuffer> {
        self.volume_key
            .clone()
            .ok_or(Error::State("volume key is locked"))
    }

    /// Unwrap the stored key with `wrap_key`.
    ///
    /// # Errors
    ///
    /// [`Error::Crypto`] when the wrap key is wrong or the object is
    /// malformed.
    pub fn unlock(&mut self, wrap_key: &SecretBuffer) -> Result<()> {
        let encrypted = self
            .encrypted_key
            .as_ref()
            .ok_or(Error::State("cannot unlock a key that does not exist"))?;

        let wrapped = base64_decode(encrypted).map_err(|e| Error::Crypto(e.to_string()))?;
        let cipher_key =
            SymmetricKey::new(wrap_key.clone(), SecretBuffer::zero(AesCbc256::IV_LEN));

        let plaintext = AesCbc256::decrypt(&cipher_key, &wrapped)
            .map_err(|_| Error::Crypto("unable to unlock key".to_owned()))?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| Error::Crypto("unable to unlock key".to_owned()))?;

        let hex_key = plaintext
            .strip_prefix(metadata::VOLUME_KEY_MARKER)
            .ok_or_else(|| Error::Crypto("unable to unlock key".to_owned()))?;

        self.volume_key =
            Some(SecretBuffer::from_hex(hex_key).map_err(|e| Error::Crypto(e.to_string()))?);
        Ok(())
    }

    /// Clone the unwrapped key under a new id (key rotation step one).
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`] for temp ids, [`Error::State`] when locked.
    pub fn clone_to(&self, new_id: &str) -> Result<Self> {
        if is_temp_id(new_id) {
            return Err(Error::Invalid("invalid key id".to_owned()));
        }

        Ok(Self {
            context: Arc::clone(&self.context),
            id: new_id.to_owned(),
            encrypted_key: None,
            volume_key: Some(self.volume_key()?),
        })
    }

    /// Write the key object wrapped under `wrap_key`.
    ///
    /// Ordering: PUT the temp object, COPY it over the real id guarded by
    /// `copy-source-if-match` on the temp's etag, DELETE the temp.
    ///
    /// # Errors
    ///
    /// [`Error::State`] when locked; transfer failures leave the old key
    /// object intact.
    pub fn commit(&self, request: &mut Request, wrap_key: &SecretBuffer) -> Result<()> {
        let volume_key = self.volume_key()?;
        let context = &self.context;
        let header_prefix = context.service.header_prefix();

        let cipher_key =
            SymmetricKey::new(wrap_key.clone(), SecretBuffer::zero(AesCbc256::IV_LEN));
        let wrapped = AesCbc256::encrypt(
            &cipher_key,
            format!("{}{}", metadata::VOLUME_KEY_MARKER, volume_key.to_hex()).as_bytes(),
        )
        .map_err(|e| Error::Crypto(e.to_string()))?;

        let temp_id = format!("{VOLUME_KEY_OBJECT_TEMP_PREFIX}{}", self.id);
        let temp_url = build_url(context, &temp_id);
        let real_url = build_url(context, &self.id);

        request.init(HttpMethod::Put);
        request.set_url(&temp_url, "");
        request.set_input_buffer(bytes::Bytes::from(
            cirrus_crypto::base64_encode(&wrapped).into_bytes(),
        ));
        request.run(None)?;

        if request.response_code() != status::OK {
            return Err(Error::State(
                "failed to create the temporary volume key; the old key remains valid",
            ));
        }

        let temp_etag = request.response_header("etag").to_owned();

        // Overwrite the real key only if our temp copy is still what we
        // just wrote.
        request.init(HttpMethod::Put);
        request.set_url(&real_url, "");
        request.set_header(&format!("{header_prefix}copy-source"), &temp_url);
        request.set_header(&format!("{header_prefix}copy-source-if-match"), &temp_etag);
        request.set_header(&format!("{header_prefix}metadata-directive"), "REPLACE");
        request.run(None)?;

        if request.response_code() != status::OK {
            return Err(Error::State(
                "failed to copy the volume key into place; the old key remains valid",
            ));
        }

        request.init(HttpMethod::Delete);
        request.set_url(&temp_url, "");
        request.run(None)?;

        Ok(())
    }

    /// Delete the key object.
    ///
    /// # Errors
    ///
    /// Transfer failures.
    pub fn remove(&self, request: &mut Request) -> Result<()> {
        request.init(HttpMethod::Delete);
        request.set_url(&build_url(&self.context, &self.id), "");
        request.run(None)?;

        match request.response_code() {
            status::NO_CONTENT | status::OK => Ok(()),
            code => Err(Error::Http(code)),
        }
    }

    fn download(&mut self, request: &mut Request) -> Result<()> {
        request.init(HttpMethod::Get);
        request.set_url(&build_url(&self.context, &self.id), "");
        request.run(None)?;

        match request.response_code() {
            status::OK => {
                self.encrypted_key = Some(request.output_string());
                Ok(())
            }
            status::NOT_FOUND => {
                self.encrypted_key = None;
                Ok(())
            }
            code => Err(Error::Http(code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use cirrus_crypto::base64_encode;
    use cirrus_transport::TransportResponse;
    use parking_lot::Mutex;

    use super::*;
    use crate::fs::tests_support::test_context_with_handler;

    fn wrap(wrap_key: &SecretBuffer, volume_key_hex: &str) -> String {
        let cipher_key =
            SymmetricKey::new(wrap_key.clone(), SecretBuffer::zero(AesCbc256::IV_LEN));
        base64_encode(
            &AesCbc256::encrypt(
                &cipher_key,
                format!("{}{volume_key_hex}", metadata::VOLUME_KEY_MARKER).as_bytes(),
            )
            .expect("encrypt"),
        )
    }

    #[test]
    fn test_should_fetch_and_unlock_key() {
        let wrap_key = SecretBuffer::generate(AesCbc256::KEY_LEN);
        let volume_key = SecretBuffer::generate(AesCbc256::KEY_LEN);
        let body = wrap(&wrap_key, &volume_key.to_hex());

        let (harness, _watchdog) = test_context_with_handler(Arc::new(move |req| {
            assert!(req.url.contains("%24s3fuse%24_encryption_vk_default"));
            Ok(TransportResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: body.clone().into_bytes(),
            })
        }));

        let mut request = harness.make_request();
        let mut key = VolumeKey::fetch(&harness.context, &mut request, "default")
            .expect("fetch")
            .expect("present");

        key.unlock(&wrap_key).expect("unlock");
        assert_eq!(key.volume_key().expect("unlocked"), volume_key);
    }

    #[test]
    fn test_should_reject_wrong_wrap_key() {
        let wrap_key = SecretBuffer::generate(AesCbc256::KEY_LEN);
        let body = wrap(&wrap_key, &SecretBuffer::generate(32).to_hex());

        let (harness, _watchdog) = test_context_with_handler(Arc::new(move |_req| {
            Ok(TransportResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: body.clone().into_bytes(),
            })
        }));

        let mut request = harness.make_request();
        let mut key = VolumeKey::fetch(&harness.context, &mut request, "default")
            .expect("fetch")
            .expect("present");

        let wrong = SecretBuffer::generate(AesCbc256::KEY_LEN);
        assert!(key.unlock(&wrong).is_err());
        assert!(key.volume_key().is_err());
    }

    #[test]
    fn test_should_report_absent_key() {
        let (harness, _watchdog) = test_context_with_handler(Arc::new(|_req| {
            Ok(TransportResponse {
                status: 404,
                headers: BTreeMap::new(),
                body: Vec::new(),
            })
        }));

        let mut request = harness.make_request();
        assert!(
            VolumeKey::fetch(&harness.context, &mut request, "default")
                .expect("fetch")
                .is_none()
        );
    }

    #[test]
    fn test_should_refuse_generating_over_existing_key() {
        let (harness, _watchdog) = test_context_with_handler(Arc::new(|_req| {
            Ok(TransportResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: b"whatever".to_vec(),
            })
        }));

        let mut request = harness.make_request();
        assert!(matches!(
            VolumeKey::generate(&harness.context, &mut request, "default"),
            Err(Error::Exists)
        ));
    }

    #[test]
    fn test_should_refuse_temp_ids() {
        let (harness, _watchdog) = test_context_with_handler(Arc::new(|_req| {
            Ok(TransportResponse {
                status: 404,
                headers: BTreeMap::new(),
                body: Vec::new(),
            })
        }));

        let mut request = harness.make_request();
        assert!(VolumeKey::generate(&harness.context, &mut request, "$temp$_x").is_err());
    }

    #[test]
    fn test_should_commit_via_temp_copy_delete() {
        use cirrus_transport::HttpMethod;

        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);

        let (harness, _watchdog) = test_context_with_handler(Arc::new(move |req| {
            let mut log = log_clone.lock();
            match req.method {
                HttpMethod::Get => {
                    return Ok(TransportResponse {
                        status: 404,
                        headers: BTreeMap::new(),
                        body: Vec::new(),
                    });
                }
                HttpMethod::Put if req.headers.keys().any(|k| k.contains("copy-source")) => {
                    assert!(
                        req.headers
                            .iter()
                            .any(|(k, v)| k.contains("copy-source-if-match") && v == "\"tmp-etag\"")
                    );
                    log.push(format!("copy {}", req.url));
                }
                HttpMethod::Put => {
                    log.push(format!("put {}", req.url));
                    return Ok(TransportResponse {
                        status: 200,
                        headers: [("etag".to_owned(), "\"tmp-etag\"".to_owned())]
                            .into_iter()
                            .collect(),
                        body: Vec::new(),
                    });
                }
                HttpMethod::Delete => log.push(format!("delete {}", req.url)),
                HttpMethod::Head | HttpMethod::Post => {}
            }
            Ok(TransportResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: Vec::new(),
            })
        }));

        let mut request = harness.make_request();
        let key =
            VolumeKey::generate(&harness.context, &mut request, "default").expect("generate");
        let wrap_key = SecretBuffer::generate(AesCbc256::KEY_LEN);
        key.commit(&mut request, &wrap_key).expect("commit");

        let log = log.lock();
        assert_eq!(log.len(), 3);
        assert!(log[0].starts_with("put") && log[0].contains("%24temp%24_default"));
        assert!(log[1].starts_with("copy") && !log[1].contains("%24temp%24_"));
        assert!(log[2].starts_with("delete") && log[2].contains("%24temp%24_default"));
    }

    #[test]
    fn test_should_round_trip_wrap_and_unlock_via_commit_body() {
        // The commit body, decrypted with the same wrap key, recovers the
        // volume key byte-for-byte.
        let wrap_key = SecretBuffer::generate(AesCbc256::KEY_LEN);
        let volume_key = SecretBuffer::generate(AesCbc256::KEY_LEN);
        let body = wrap(&wrap_key, &volume_key.to_hex());

        let cipher_key =
            SymmetricKey::new(wrap_key.clone(), SecretBuffer::zero(AesCbc256::IV_LEN));
        let plaintext = AesCbc256::decrypt(
            &cipher_key,
            &cirrus_crypto::base64_decode(&body).expect("b64"),
        )
        .expect("decrypt");
        let plaintext = String::from_utf8(plaintext).expect("utf8");

        assert_eq!(
            plaintext,
            format!("{}{}", metadata::VOLUME_KEY_MARKER, volume_key.to_hex())
        );
    }
}
