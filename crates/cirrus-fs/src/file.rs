//! The open-file engine.
//!
//! Each file object carries a state machine: a bitset of
//! {DOWNLOADING, UPLOADING, WRITING, DIRTY}, an open reference count, and
//! a latched async error. The first open creates a local backing file and
//! posts a background download; reads and writes wait on the condition
//! variable while a transfer owns the file; flush uploads dirty contents
//! with the engine lock released so readers and writers can queue.
//!
//! Transfers are hash-aware: a chunked SHA-256 list follows every chunk
//! that moves, and the root is checked after downloads and recorded into
//! object metadata after uploads. Encrypted files splice the CTR
//! transform into the same chunk path.

use std::sync::Arc;

use cirrus_core::{Error, Result, is_valid_quoted_md5_etag};
use cirrus_crypto::Sha256HashList;
use cirrus_transport::{HttpMethod, Priority, status};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::encrypted_file::FileCrypto;
use crate::local::LocalFile;
use crate::metadata;
use crate::object::Object;

const FS_DOWNLOADING: u32 = 0x1;
const FS_UPLOADING: u32 = 0x2;
const FS_WRITING: u32 = 0x4;
const FS_DIRTY: u32 = 0x8;

/// How a file is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open for read/write at the current contents.
    Default,
    /// `O_TRUNC`: drop the contents.
    Truncate,
}

#[derive(Debug, Default)]
struct Engine {
    status: u32,
    ref_count: u64,
    async_error: i32,
    local: Option<Arc<LocalFile>>,
}

/// The file half of an object: engine state, hash bookkeeping, and the
/// optional encryption layer.
#[derive(Debug)]
pub struct FileNode {
    engine: Mutex<Engine>,
    condition: Condvar,
    sha256: Mutex<String>,
    hash_list: Mutex<Option<Arc<Sha256HashList>>>,
    crypto: Option<FileCrypto>,
}

impl FileNode {
    pub(crate) fn new(encrypted: bool) -> Self {
        Self {
            engine: Mutex::new(Engine::default()),
            condition: Condvar::new(),
            sha256: Mutex::new(String::new()),
            hash_list: Mutex::new(None),
            crypto: encrypted.then(FileCrypto::default),
        }
    }

    /// Whether this file is stored encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some()
    }

    /// Whether any handle is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.engine.lock().ref_count > 0
    }

    /// The size of the local backing file, when one exists.
    #[must_use]
    pub fn local_size(&self) -> Option<u64> {
        let local = self.engine.lock().local.clone()?;
        local.size().ok()
    }

    /// The recorded plaintext SHA-256 root (empty when unknown).
    #[must_use]
    pub fn sha256_hash(&self) -> String {
        self.sha256.lock().clone()
    }

    fn set_sha256_hash(&self, hash: &str) {
        if !hash.is_empty() {
            *self.sha256.lock() = hash.to_owned();
        }
    }

    // -- header plumbing ---------------------------------------------------

    pub(crate) fn init_from_response(&self, object: &Object, request: &cirrus_transport::Request) {
        let meta_prefix = object.context().service.header_meta_prefix();

        if let Some(crypto) = &self.crypto {
            let enc_iv = request
                .response_header(&format!("{meta_prefix}{}", metadata::ENC_IV))
                .to_owned();
            let enc_meta = request
                .response_header(&format!("{meta_prefix}{}", metadata::ENC_METADATA))
                .to_owned();

            if !object.is_intact() {
                debug!(path = object.path(), "encrypted file is not intact");
                return;
            }

            let volume_key = object
                .context()
                .encryption
                .as_ref()
                .map(|encryption| encryption.volume_key());

            if let Some(sha256) =
                crypto.unlock_from_headers(object.path(), volume_key.as_ref(), &enc_iv, &enc_meta)
            {
                self.set_sha256_hash(&sha256);
            }
        } else if object.is_intact() {
            // We were the last writer, so the recorded root is the root
            // of the current contents.
            let sha256 = request
                .response_header(&format!("{meta_prefix}{}", metadata::SHA256))
                .to_owned();
            self.set_sha256_hash(&sha256);
        }
    }

    pub(crate) fn set_request_headers(
        &self,
        object: &Object,
        request: &mut cirrus_transport::Request,
    ) {
        let meta_prefix = object.context().service.header_meta_prefix().to_owned();

        if let Some(crypto) = &self.crypto {
            // Hide the real hash; it travels inside the envelope.
            request.set_header(&format!("{meta_prefix}{}", metadata::SHA256), "");

            let (enc_iv, enc_meta) = crypto.envelope();
            request.set_header(&format!("{meta_prefix}{}", metadata::ENC_IV), &enc_iv);
            request.set_header(&format!("{meta_prefix}{}", metadata::ENC_METADATA), &enc_meta);
        } else {
            request.set_header(
                &format!("{meta_prefix}{}", metadata::SHA256),
                &self.sha256_hash(),
            );
        }
    }

    // -- open/release ------------------------------------------------------

    /// Whether a download may start. Encrypted files refuse without a
    /// data key.
    fn is_downloadable(&self) -> Result<()> {
        match &self.crypto {
            Some(crypto) if !crypto.is_unlocked() => Err(Error::PermissionDenied),
            _ => Ok(()),
        }
    }

    /// Open the file; the first open allocates the backing file and, for
    /// non-truncating opens of non-empty objects, starts the download.
    ///
    /// # Errors
    ///
    /// [`Error::PermissionDenied`] for locked encrypted files, I/O and
    /// transfer errors otherwise.
    pub fn open(object: &Arc<Object>, mode: OpenMode) -> Result<()> {
        let node = object.file_node().ok_or(Error::IsDir)?;
        let context = object.context();
        let mut engine = node.engine.lock();

        if engine.ref_count > 0 {
            context.stats.counter("file.reopens").incr();
        } else {
            if let Some(local) = engine.local.clone() {
                if mode == OpenMode::Truncate {
                    // No point checking the remote copy if we are about
                    // to truncate anyway.
                    if local.size()? > 0 {
                        local.truncate(0)?;
                        engine.status = FS_DIRTY;
                    }
                } else if context.config.verify_etag_before_reopen
                    && !node.remote_etag_matches(object)?
                {
                    debug!(path = object.path(), "etag not consistent, reopening");
                    context
                        .stats
                        .counter("file.failed_reopens_on_inconsistent_etag")
                        .incr();
                    engine.local = None;
                }
            }

            if engine.local.is_some() {
                debug!(path = object.path(), "reopening from local store");
                context.stats.counter("file.reopens_from_local_store").incr();
            } else {
                let size = object.stat().size;
                engine.local = Some(Arc::new(LocalFile::new(&context.store, size)?));

                if mode == OpenMode::Truncate {
                    // A non-empty object opened with O_TRUNC must be
                    // written back as zero-length.
                    if size > 0 {
                        engine.status = FS_DIRTY;
                    }
                } else if size > 0 {
                    node.is_downloadable()?;

                    engine.status = FS_DOWNLOADING;

                    let work_object = Arc::clone(object);
                    let done_object = Arc::clone(object);
                    context.pool.post_callback(
                        Priority::Pr0,
                        Box::new(move |_request| FileNode::download(&work_object)),
                        Box::new(move |result| {
                            FileNode::on_download_complete(&done_object, &result);
                        }),
                    );
                }
            }
        }

        engine.ref_count += 1;
        Ok(())
    }

    fn on_download_complete(object: &Arc<Object>, result: &Result<()>) {
        let Some(node) = object.file_node() else { return };
        let mut engine = node.engine.lock();

        if engine.status != FS_DOWNLOADING {
            error!(
                path = object.path(),
                status = engine.status,
                "inconsistent state on download completion"
            );
            return;
        }

        engine.async_error = match result {
            Ok(()) => 0,
            Err(e) => e.to_errno(),
        };
        engine.status = 0;
        node.condition.notify_all();
    }

    /// Release one handle. The last release requires a quiescent engine,
    /// refreshes the cached size, and (unless persistence is on) drops
    /// the backing file.
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`] on a spurious release, [`Error::State`] when
    /// the engine is not quiescent.
    pub fn release(object: &Arc<Object>) -> Result<()> {
        let node = object.file_node().ok_or(Error::IsDir)?;
        let mut engine = node.engine.lock();

        if engine.ref_count == 0 {
            warn!(path = object.path(), "releasing file with zero ref-count");
            return Err(Error::Invalid("file is not open".to_owned()));
        }

        engine.ref_count -= 1;

        if engine.ref_count == 0 {
            if engine.status != 0 {
                error!(
                    path = object.path(),
                    status = engine.status,
                    "released file with non-quiescent status"
                );
                return Err(Error::State("released file while a transfer is active"));
            }

            // Subsequent stat calls get the local size.
            if let Some(local) = &engine.local {
                if let Ok(size) = local.size() {
                    object.set_size(size);
                }
            }

            if !object.context().store.persistence_enabled() {
                engine.local = None;
                object.expire();
            }
        }

        Ok(())
    }

    /// Drop the backing file and force a cache refresh.
    pub fn purge(&self, object: &Object) {
        self.engine.lock().local = None;
        object.expire();
    }

    // -- I/O ---------------------------------------------------------------

    /// Read at `offset`, waiting out a download in progress.
    ///
    /// # Errors
    ///
    /// The latched async error, or I/O failures.
    pub fn read(object: &Arc<Object>, buf: &mut [u8], offset: u64) -> Result<usize> {
        let node = object.file_node().ok_or(Error::IsDir)?;
        let mut engine = node.engine.lock();

        while engine.status & FS_DOWNLOADING != 0 {
            node.condition.wait(&mut engine);
        }

        if engine.async_error != 0 {
            return Err(Error::from_errno(engine.async_error));
        }

        let local = engine.local.clone().ok_or(Error::State("file is not open"))?;
        drop(engine);

        local.read_at(buf, offset)
    }

    /// Write at `offset`, waiting out transfers in progress; marks the
    /// file dirty.
    ///
    /// # Errors
    ///
    /// The latched async error, or I/O failures.
    pub fn write(object: &Arc<Object>, data: &[u8], offset: u64) -> Result<usize> {
        let node = object.file_node().ok_or(Error::IsDir)?;
        let mut engine = node.engine.lock();

        while engine.status & (FS_DOWNLOADING | FS_UPLOADING) != 0 {
            node.condition.wait(&mut engine);
        }

        if engine.async_error != 0 {
            return Err(Error::from_errno(engine.async_error));
        }

        let local = engine.local.clone().ok_or(Error::State("file is not open"))?;
        engine.status |= FS_DIRTY | FS_WRITING;
        drop(engine);

        let result = local.write_at(data, offset);

        let mut engine = node.engine.lock();
        engine.status &= !FS_WRITING;
        node.condition.notify_all();
        drop(engine);

        result
    }

    /// Truncate to `len`; marks the file dirty even when the size does
    /// not change.
    ///
    /// # Errors
    ///
    /// The latched async error, or I/O failures.
    pub fn truncate(object: &Arc<Object>, len: u64) -> Result<()> {
        let node = object.file_node().ok_or(Error::IsDir)?;
        let mut engine = node.engine.lock();

        while engine.status & (FS_DOWNLOADING | FS_UPLOADING) != 0 {
            node.condition.wait(&mut engine);
        }

        if engine.async_error != 0 {
            return Err(Error::from_errno(engine.async_error));
        }

        let local = engine.local.clone().ok_or(Error::State("file is not open"))?;
        engine.status |= FS_DIRTY | FS_WRITING;
        drop(engine);

        let result = local.truncate(len);

        let mut engine = node.engine.lock();
        engine.status &= !FS_WRITING;
        node.condition.notify_all();
        drop(engine);

        result
    }

    /// Upload dirty contents. A clean file is a no-op.
    ///
    /// # Errors
    ///
    /// The latched async error, upload and commit failures (which also
    /// latch).
    pub fn flush(object: &Arc<Object>) -> Result<()> {
        let node = object.file_node().ok_or(Error::IsDir)?;
        let context = object.context();
        let mut engine = node.engine.lock();

        while engine.status & (FS_DOWNLOADING | FS_UPLOADING | FS_WRITING) != 0 {
            node.condition.wait(&mut engine);
        }

        if engine.async_error != 0 {
            return Err(Error::from_errno(engine.async_error));
        }

        let local = engine.local.clone().ok_or(Error::State("file is not open"))?;
        local.refresh_store_size();

        if engine.status & FS_DIRTY == 0 {
            debug!(path = object.path(), "skipping flush for non-dirty file");
            context.stats.counter("file.non_dirty_flushes").incr();
            return Ok(());
        }

        engine.status |= FS_UPLOADING;
        drop(engine);

        let work_object = Arc::clone(object);
        let result = context.pool.call(
            Priority::Pr0,
            Box::new(move |_request| FileNode::upload(&work_object)),
        );

        let mut engine = node.engine.lock();
        engine.async_error = match &result {
            Ok(()) => 0,
            Err(e) => e.to_errno(),
        };
        engine.status = 0;
        node.condition.notify_all();
        drop(engine);

        result
    }

    // -- chunk plumbing ----------------------------------------------------

    fn local(&self) -> Result<Arc<LocalFile>> {
        self.engine
            .lock()
            .local
            .clone()
            .ok_or(Error::State("file has no local backing"))
    }

    fn write_chunk(object: &Object, data: &[u8], offset: u64) -> Result<()> {
        let node = object.file_node().ok_or(Error::IsDir)?;
        let local = node.local()?;

        let plaintext: std::borrow::Cow<'_, [u8]> = match &node.crypto {
            Some(crypto) => {
                let mut buf = data.to_vec();
                crypto.transform_chunk(&mut buf, offset)?;
                buf.into()
            }
            None => data.into(),
        };

        local.write_all_at(&plaintext, offset)?;

        if let Some(list) = node.hash_list.lock().clone() {
            list.compute_hash(offset, &plaintext)
                .map_err(|e| Error::Crypto(e.to_string()))?;
        }

        Ok(())
    }

    fn read_chunk(object: &Object, size: u64, offset: u64) -> Result<Vec<u8>> {
        let node = object.file_node().ok_or(Error::IsDir)?;
        let local = node.local()?;

        let mut buf = vec![0u8; size as usize];
        local.read_exact_at(&mut buf, offset)?;

        if let Some(list) = node.hash_list.lock().clone() {
            list.compute_hash(offset, &buf)
                .map_err(|e| Error::Crypto(e.to_string()))?;
        }

        if let Some(crypto) = &node.crypto {
            crypto.transform_chunk(&mut buf, offset)?;
        }

        Ok(buf)
    }

    // -- transfers ---------------------------------------------------------

    fn download(object: &Arc<Object>) -> Result<()> {
        let node = object.file_node().ok_or(Error::IsDir)?;
        let context = object.context();
        let local = node.local()?;
        let size = local.size()?;

        // With a known root, hash every chunk as it lands.
        *node.hash_list.lock() = (!node.sha256_hash().is_empty())
            .then(|| Arc::new(Sha256HashList::new(size)));

        let write_object = Arc::clone(object);
        let on_write: Arc<cirrus_services::WriteChunkFn> =
            Arc::new(move |data, offset| FileNode::write_chunk(&write_object, data, offset));

        context.transfer.download(object.url(), size, &on_write)?;

        node.finalize_download(object, &local)
    }

    fn finalize_download(&self, object: &Object, local: &LocalFile) -> Result<()> {
        let stats = &object.context().stats;
        let expected_sha256 = self.sha256_hash();

        if !expected_sha256.is_empty() {
            let list = self
                .hash_list
                .lock()
                .clone()
                .ok_or(Error::State("download finished without a hash list"))?;
            let computed = list.root_hash_hex();

            if computed != expected_sha256 {
                stats.counter("file.sha256_mismatches").incr();
                warn!(
                    path = object.path(),
                    expected = %expected_sha256,
                    computed = %computed,
                    "sha256 mismatch"
                );
                return Err(Error::Integrity {
                    expected: expected_sha256,
                    actual: computed,
                });
            }
        } else if is_valid_quoted_md5_etag(&object.etag()) {
            // Fall back to the etag as an MD5 of the body.
            let expected = object.etag();
            let computed = local.md5()?;

            if computed != expected {
                stats.counter("file.md5_mismatches").incr();
                warn!(
                    path = object.path(),
                    expected = %expected,
                    computed = %computed,
                    "md5 mismatch"
                );
                return Err(Error::Integrity {
                    expected,
                    actual: computed,
                });
            }
        } else {
            stats.counter("file.no_hash_checks").incr();
            warn!(path = object.path(), "no hash check performed");
        }

        Ok(())
    }

    fn upload(object: &Arc<Object>) -> Result<()> {
        let node = object.file_node().ok_or(Error::IsDir)?;
        let context = object.context();
        let local = node.local()?;
        let size = local.size()?;

        *node.hash_list.lock() = Some(Arc::new(Sha256HashList::new(size)));

        if let Some(crypto) = &node.crypto {
            let encryption = context
                .encryption
                .as_ref()
                .ok_or(Error::PermissionDenied)?;
            crypto.prepare_upload(&encryption.volume_key());
        }

        let read_object = Arc::clone(object);
        let on_read: Arc<cirrus_services::ReadChunkFn> =
            Arc::new(move |chunk_size, offset| FileNode::read_chunk(&read_object, chunk_size, offset));

        let etag = context.transfer.upload(object.url(), size, &on_read)?;

        // Record the new root (and, for encrypted files, the envelope),
        // then persist it all through a metadata commit.
        object.set_etag(&etag);

        let root = node
            .hash_list
            .lock()
            .clone()
            .ok_or(Error::State("upload finished without a hash list"))?
            .root_hash_hex();
        *node.sha256.lock() = root.clone();

        if let Some(crypto) = &node.crypto {
            crypto.finalize_upload(&root)?;
        }

        let commit_object = Arc::clone(object);
        context.pool.call(
            Priority::PrReq0,
            Box::new(move |request| commit_object.commit(request)),
        )
    }

    fn remote_etag_matches(&self, object: &Arc<Object>) -> Result<bool> {
        let context = object.context();
        let url = object.url().to_owned();
        let expected = object.etag();
        let matches = Arc::new(Mutex::new(false));
        let matches_out = Arc::clone(&matches);

        context.pool.call(
            Priority::PrReq0,
            Box::new(move |request| {
                request.init(HttpMethod::Head);
                request.set_url(&url, "");
                request.run(None)?;

                if request.response_code() != status::OK {
                    return Err(Error::Http(request.response_code()));
                }

                *matches_out.lock() = request.response_header("etag") == expected;
                Ok(())
            }),
        )?;

        let result = *matches.lock();
        Ok(result)
    }
}
