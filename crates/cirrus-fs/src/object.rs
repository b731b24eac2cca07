//! The object model: shared metadata plus per-kind behavior.
//!
//! An [`Object`] is one cache entry: the bucket-relative path, the object
//! URL, a stat structure carried in provider metadata headers, the xattr
//! map, and freshness bookkeeping. Concrete kinds (file, directory,
//! symlink, FIFO) hang off [`ObjectKind`]; files carry the open-file
//! engine, optionally wrapped by the encryption layer.
//!
//! Objects are constructed from HEAD responses through the
//! [`TypeCheckerRegistry`]: an ordered list of predicates, each of which
//! either produces the matching kind or declines, with a regular file as
//! the last resort.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cirrus_core::{Error, Result, is_valid_quoted_md5_etag, url_encode};
use cirrus_transport::{HttpMethod, Request, status};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::file::FileNode;
use crate::fs::FsContext;
use crate::metadata;
use crate::xattr::{StaticXattr, XattrFlags, is_settable_key};

const BLOCK_SIZE: u64 = 512;

/// UNIX stat fields carried in object metadata.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    /// File type and permission bits.
    pub mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Modification time, unix seconds.
    pub mtime: i64,
    /// Size in bytes.
    pub size: u64,
    /// 512-byte blocks.
    pub blocks: u64,
    /// Link count (always 1; computing it is not worth the listing).
    pub nlink: u32,
}

impl Default for Stat {
    fn default() -> Self {
        Self {
            mode: 0,
            uid: 0,
            gid: 0,
            mtime: 0,
            size: 0,
            blocks: 0,
            nlink: 1,
        }
    }
}

/// Per-kind state.
#[derive(Debug)]
pub enum ObjectKind {
    /// A regular file with the open-file engine (and, for encrypted
    /// files, the per-file key state).
    File(FileNode),
    /// A directory, optionally memoizing its child names.
    Directory(crate::directory::DirNode),
    /// A symlink whose target is the object body.
    Symlink(Mutex<Option<String>>),
    /// A FIFO marker object.
    Fifo,
}

impl ObjectKind {
    /// The `S_IFMT` bits of this kind.
    #[must_use]
    pub fn type_bits(&self) -> u32 {
        match self {
            Self::File(_) => libc::S_IFREG,
            Self::Directory(_) => libc::S_IFDIR,
            Self::Symlink(_) => libc::S_IFLNK,
            Self::Fifo => libc::S_IFIFO,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ObjectState {
    pub content_type: String,
    pub etag: String,
    pub mtime_etag: String,
    pub intact: bool,
    pub stat: Stat,
    pub expiry: Option<Instant>,
    pub xattrs: BTreeMap<String, StaticXattr>,
}

/// One cached object.
pub struct Object {
    context: Arc<FsContext>,
    path: String,
    url: String,
    kind: ObjectKind,
    pub(crate) state: Mutex<ObjectState>,
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("path", &self.path)
            .field("kind", &self.kind.type_bits())
            .finish_non_exhaustive()
    }
}

impl Object {
    /// The URL of a file-like object at `path`.
    #[must_use]
    pub fn build_url(context: &FsContext, path: &str) -> String {
        format!("{}/{}", context.service.bucket_url(), url_encode(path))
    }

    /// The URL of the directory object at `path`.
    #[must_use]
    pub fn build_directory_url(context: &FsContext, path: &str) -> String {
        format!("{}/{}/", context.service.bucket_url(), url_encode(path))
    }

    /// The URL of the internal object `name`.
    #[must_use]
    pub fn build_internal_url(context: &FsContext, name: &str) -> String {
        Self::build_url(context, &metadata::internal_path(name))
    }

    fn new(context: Arc<FsContext>, path: &str, kind: ObjectKind) -> Arc<Self> {
        let config = &context.config;

        let mut stat = Stat {
            mode: kind.type_bits() | (config.default_mode & !libc::S_IFMT),
            uid: if config.default_uid == u32::MAX {
                // SAFETY: geteuid has no failure modes or side effects.
                unsafe { libc::geteuid() }
            } else {
                config.default_uid
            },
            gid: if config.default_gid == u32::MAX {
                // SAFETY: getegid has no failure modes or side effects.
                unsafe { libc::getegid() }
            } else {
                config.default_gid
            },
            mtime: chrono::Utc::now().timestamp(),
            ..Stat::default()
        };

        if matches!(kind, ObjectKind::Symlink(_)) {
            stat.mode = libc::S_IFLNK | 0o777;
        }

        let (url, content_type) = match &kind {
            ObjectKind::Directory(_) => (
                Self::build_directory_url(&context, path),
                config.default_content_type.clone(),
            ),
            ObjectKind::Symlink(_) => (
                Self::build_url(&context, path),
                metadata::SYMLINK_CONTENT_TYPE.to_owned(),
            ),
            ObjectKind::Fifo => (
                Self::build_url(&context, path),
                metadata::FIFO_CONTENT_TYPE.to_owned(),
            ),
            ObjectKind::File(node) => {
                let content_type = if node.is_encrypted() {
                    metadata::ENCRYPTED_CONTENT_TYPE.to_owned()
                } else if config.auto_detect_mime_type {
                    detect_content_type(path)
                        .unwrap_or_else(|| config.default_content_type.clone())
                } else {
                    config.default_content_type.clone()
                };
                (Self::build_url(&context, path), content_type)
            }
        };

        Arc::new(Self {
            context,
            path: path.to_owned(),
            url,
            kind,
            state: Mutex::new(ObjectState {
                content_type,
                stat,
                ..ObjectState::default()
            }),
        })
    }

    /// Create a plain file object.
    #[must_use]
    pub fn new_file(context: Arc<FsContext>, path: &str) -> Arc<Self> {
        Self::new(context, path, ObjectKind::File(FileNode::new(false)))
    }

    /// Create an encrypted file object.
    #[must_use]
    pub fn new_encrypted_file(context: Arc<FsContext>, path: &str) -> Arc<Self> {
        Self::new(context, path, ObjectKind::File(FileNode::new(true)))
    }

    /// Create a directory object.
    #[must_use]
    pub fn new_directory(context: Arc<FsContext>, path: &str) -> Arc<Self> {
        Self::new(
            context,
            path,
            ObjectKind::Directory(crate::directory::DirNode::default()),
        )
    }

    /// Create a symlink object.
    #[must_use]
    pub fn new_symlink(context: Arc<FsContext>, path: &str) -> Arc<Self> {
        Self::new(context, path, ObjectKind::Symlink(Mutex::new(None)))
    }

    /// Create a FIFO marker object.
    #[must_use]
    pub fn new_fifo(context: Arc<FsContext>, path: &str) -> Arc<Self> {
        Self::new(context, path, ObjectKind::Fifo)
    }

    /// The bucket-relative path (no leading slash).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The object URL (directory objects carry the trailing slash).
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The engine context this object belongs to.
    #[must_use]
    pub fn context(&self) -> &Arc<FsContext> {
        &self.context
    }

    /// The per-kind state.
    #[must_use]
    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// The `S_IFMT` bits of this object.
    #[must_use]
    pub fn type_bits(&self) -> u32 {
        self.kind.type_bits()
    }

    /// The file engine, when this is a file.
    #[must_use]
    pub fn file_node(&self) -> Option<&FileNode> {
        match &self.kind {
            ObjectKind::File(node) => Some(node),
            _ => None,
        }
    }

    /// The directory state, when this is a directory.
    #[must_use]
    pub fn dir_node(&self) -> Option<&crate::directory::DirNode> {
        match &self.kind {
            ObjectKind::Directory(node) => Some(node),
            _ => None,
        }
    }

    /// A copy of the stat, with the local backing size when one exists.
    #[must_use]
    pub fn stat(&self) -> Stat {
        let mut stat = self.state.lock().stat;

        if let Some(node) = self.file_node() {
            if let Some(size) = node.local_size() {
                stat.size = size;
                stat.blocks = size.div_ceil(BLOCK_SIZE);
            }
        }

        stat
    }

    /// The current ETag.
    #[must_use]
    pub fn etag(&self) -> String {
        self.state.lock().etag.clone()
    }

    pub(crate) fn set_etag(&self, etag: &str) {
        self.state.lock().etag = etag.to_owned();
    }

    /// The content type.
    #[must_use]
    pub fn content_type(&self) -> String {
        self.state.lock().content_type.clone()
    }

    /// Whether the recorded metadata matches the last HEAD's etag.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.state.lock().intact
    }

    /// Replace the permission bits (type bits are preserved; zero mode
    /// falls back to the configured default).
    pub fn set_mode(&self, mode: u32) {
        let mut mode = mode & !libc::S_IFMT;
        if mode == 0 {
            mode = self.context.config.default_mode;
        }

        let mut state = self.state.lock();
        state.stat.mode = self.kind.type_bits() | mode;
    }

    /// Replace the owner uid.
    pub fn set_uid(&self, uid: u32) {
        self.state.lock().stat.uid = uid;
    }

    /// Replace the owner gid.
    pub fn set_gid(&self, gid: u32) {
        self.state.lock().stat.gid = gid;
    }

    /// Replace the modification time.
    pub fn set_mtime(&self, mtime: i64) {
        let mut state = self.state.lock();
        state.stat.mtime = mtime;
        // Suppress the Last-Modified fallback on the next init.
        let etag = state.etag.clone();
        state.mtime_etag = etag;
    }

    pub(crate) fn set_size(&self, size: u64) {
        let mut state = self.state.lock();
        state.stat.size = size;
        state.stat.blocks = size.div_ceil(BLOCK_SIZE);
    }

    // -- freshness ---------------------------------------------------------

    /// Force this entry stale.
    pub fn expire(&self) {
        self.state.lock().expiry = None;
    }

    /// Whether the cache entry is stale. Open files never expire.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        if let Some(node) = self.file_node() {
            if node.is_open() {
                return false;
            }
        }

        self.state
            .lock()
            .expiry
            .is_none_or(|expiry| Instant::now() > expiry)
    }

    /// Whether the sweep may drop this entry.
    #[must_use]
    pub fn is_removable(&self) -> bool {
        self.file_node().is_none_or(|node| !node.is_open())
    }

    // -- wire parsing ------------------------------------------------------

    /// Populate from a successful HEAD (or implicit-create) response.
    pub fn init_from_response(&self, request: &Request) {
        let meta_prefix = self.context.service.header_meta_prefix();
        let header = |suffix: &str| request.response_header(&format!("{meta_prefix}{suffix}"));

        let mut state = self.state.lock();

        state.content_type = request.response_header("content-type").to_owned();
        if state.content_type.is_empty() {
            state.content_type = self.context.config.default_content_type.clone();
        }

        let prior_etag = header(metadata::MTIME_ETAG).to_owned();
        state.etag = request.response_header("etag").to_owned();

        // "Intact" means we were the last writer of this object's
        // metadata, so engine-recorded fields can be trusted.
        state.intact = !state.etag.is_empty() && prior_etag == state.etag;

        if let Ok(size) = request.response_header("content-length").parse::<u64>() {
            state.stat.size = size;
            state.stat.blocks = size.div_ceil(BLOCK_SIZE);
        }

        if let Ok(mode) = u32::from_str_radix(header(metadata::MODE), 8) {
            state.stat.mode = self.kind.type_bits() | (mode & !libc::S_IFMT);
        }
        if let Ok(uid) = header(metadata::UID).parse() {
            state.stat.uid = uid;
        }
        if let Ok(gid) = header(metadata::GID).parse() {
            state.stat.gid = gid;
        }
        if let Ok(mtime) = header(metadata::MTIME).parse() {
            state.stat.mtime = mtime;
        }
        state.mtime_etag = prior_etag;

        // If someone else updated the object, fall back to Last-Modified.
        if state.mtime_etag != state.etag {
            if let Some(last_modified) = request.last_modified() {
                if last_modified > state.stat.mtime {
                    state.stat.mtime = last_modified;
                }
            }
        }
        state.mtime_etag = state.etag.clone();

        // Collect user xattrs; reserved keys are engine fields.
        state.xattrs.clear();
        for (name, value) in request.response_headers() {
            if let Some(key) = name.strip_prefix(meta_prefix) {
                if key.starts_with(metadata::RESERVED_PREFIX) {
                    continue;
                }
                match StaticXattr::from_header(key, value, XattrFlags::user()) {
                    Ok(attr) => {
                        state.xattrs.insert(attr.key().to_owned(), attr);
                    }
                    Err(error) => {
                        warn!(%name, %error, "dropping malformed xattr header");
                    }
                }
            }
        }

        state.expiry = Some(
            Instant::now() + Duration::from_secs(self.context.config.cache_expiry_seconds),
        );
        drop(state);

        if let Some(node) = self.file_node() {
            node.init_from_response(self, request);
        }
    }

    /// Write this object's metadata into request headers.
    pub fn set_request_headers(&self, request: &mut Request) {
        let meta_prefix = self.context.service.header_meta_prefix().to_owned();
        let state = self.state.lock();

        // Serialize xattrs first so reserved keys below win.
        for attr in state.xattrs.values() {
            if attr.flags().serializable {
                let (key, value) = attr.to_header();
                request.set_header(&format!("{meta_prefix}{key}"), &value);
            }
        }

        request.set_header(
            &format!("{meta_prefix}{}", metadata::MODE),
            &format!("0{:o}", state.stat.mode & !libc::S_IFMT),
        );
        request.set_header(
            &format!("{meta_prefix}{}", metadata::UID),
            &state.stat.uid.to_string(),
        );
        request.set_header(
            &format!("{meta_prefix}{}", metadata::GID),
            &state.stat.gid.to_string(),
        );
        request.set_header(
            &format!("{meta_prefix}{}", metadata::MTIME),
            &state.stat.mtime.to_string(),
        );
        request.set_header(
            &format!("{meta_prefix}{}", metadata::MTIME_ETAG),
            &state.etag,
        );
        request.set_header("Content-Type", &state.content_type);
        drop(state);

        if let Some(node) = self.file_node() {
            node.set_request_headers(self, request);
        }
    }

    // -- remote operations -------------------------------------------------

    /// Commit metadata: a self-referential COPY with
    /// `metadata-directive: REPLACE`, guarded by `copy-source-if-match`.
    ///
    /// The copy itself assigns a new ETag (multipart ETags collapse to a
    /// content MD5), so the recorded mtime-etag chases the server's ETag
    /// until they agree; only then is the object "intact" on the next
    /// HEAD. Convergence takes at most one extra pass because a copy of
    /// unchanged content reproduces its ETag.
    ///
    /// # Errors
    ///
    /// [`Error::State`] when the object keeps changing underneath us,
    /// [`Error::NotFound`] when it is gone, transfer errors otherwise.
    pub fn commit(&self, request: &mut Request) -> Result<()> {
        let header_prefix = self.context.service.header_prefix();

        for _ in 0..3 {
            let etag_at_send = self.etag();

            request.init(HttpMethod::Put);
            request.set_url(&self.url, "");
            request.set_header(&format!("{header_prefix}copy-source"), &self.url);
            if !etag_at_send.is_empty() {
                request
                    .set_header(&format!("{header_prefix}copy-source-if-match"), &etag_at_send);
            }
            request.set_header(&format!("{header_prefix}metadata-directive"), "REPLACE");
            self.set_request_headers(request);

            request.run(None)?;

            match request.response_code() {
                status::OK => {
                    // COPY responses carry the new ETag in the header or
                    // in a CopyObjectResult body.
                    let mut new_etag = request.response_header("etag").to_owned();
                    if new_etag.is_empty() {
                        new_etag = cirrus_services::xml::parse_copy_object_etag(
                            request.output_buffer(),
                        )
                        .unwrap_or_default();
                    }

                    if new_etag.is_empty() || new_etag == etag_at_send {
                        let mut state = self.state.lock();
                        state.mtime_etag = etag_at_send;
                        state.intact = true;
                        state.expiry = Some(
                            Instant::now()
                                + Duration::from_secs(self.context.config.cache_expiry_seconds),
                        );
                        return Ok(());
                    }

                    debug!(url = %self.url, "etag moved during commit, re-committing");
                    self.set_etag(&new_etag);
                }
                status::NOT_FOUND => return Err(Error::NotFound),
                412 => {
                    warn!(url = %self.url, "object changed during metadata commit");
                    return Err(Error::State("object changed during commit"));
                }
                code => {
                    warn!(url = %self.url, code, "failed to commit object metadata");
                    return Err(Error::Http(code));
                }
            }
        }

        Err(Error::State("object kept changing during commit"))
    }

    /// Create the object remotely with a zero-length body (directories,
    /// fresh files, FIFOs) or the given body (symlinks).
    ///
    /// # Errors
    ///
    /// Transfer errors.
    pub fn create_remote(&self, request: &mut Request, body: &[u8]) -> Result<()> {
        request.init(HttpMethod::Put);
        request.set_url(&self.url, "");
        self.set_request_headers(request);
        request.set_input_buffer(bytes::Bytes::copy_from_slice(body));

        request.run(None)?;

        match request.response_code() {
            status::OK => {
                let mut state = self.state.lock();
                state.etag = request.response_header("etag").to_owned();
                let etag = state.etag.clone();
                state.mtime_etag = etag;
                state.intact = true;
                state.expiry = Some(
                    Instant::now()
                        + Duration::from_secs(self.context.config.cache_expiry_seconds),
                );
                Ok(())
            }
            code => Err(Error::Http(code)),
        }
    }

    /// Delete the object.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when already gone, transfer errors otherwise.
    pub fn remove(&self, request: &mut Request) -> Result<()> {
        remove_by_url(request, &self.url)
    }

    /// Copy this object to `to_path`, replacing metadata at the target.
    ///
    /// # Errors
    ///
    /// Transfer errors.
    pub fn copy_to(&self, request: &mut Request, to_path: &str) -> Result<()> {
        copy_by_path(&self.context, request, &self.path, to_path)
    }
}

/// DELETE an object by URL.
///
/// # Errors
///
/// [`Error::NotFound`] for a missing object, transfer errors otherwise.
pub(crate) fn remove_by_url(request: &mut Request, url: &str) -> Result<()> {
    request.init(HttpMethod::Delete);
    request.set_url(url, "");
    request.run(None)?;

    match request.response_code() {
        status::NO_CONTENT | status::OK => Ok(()),
        status::NOT_FOUND => Err(Error::NotFound),
        code => Err(Error::Http(code)),
    }
}

/// COPY `from_path` to `to_path` wholesale (data and metadata).
///
/// # Errors
///
/// [`Error::NotFound`] for a missing source, transfer errors otherwise.
pub(crate) fn copy_by_path(
    context: &FsContext,
    request: &mut Request,
    from_path: &str,
    to_path: &str,
) -> Result<()> {
    let header_prefix = context.service.header_prefix();
    let from_url = Object::build_url(context, from_path);
    let to_url = Object::build_url(context, to_path);

    request.init(HttpMethod::Put);
    request.set_url(&to_url, "");
    request.set_header(&format!("{header_prefix}copy-source"), &from_url);
    request.set_header(&format!("{header_prefix}metadata-directive"), "COPY");

    request.run(None)?;

    match request.response_code() {
        status::OK => Ok(()),
        status::NOT_FOUND => Err(Error::NotFound),
        code => Err(Error::Http(code)),
    }
}

// ---------------------------------------------------------------------------
// Xattr surface
// ---------------------------------------------------------------------------

impl Object {
    fn strip_xattr_prefix<'a>(&self, name: &'a str) -> Option<&'a str> {
        name.strip_prefix(self.context.config.xattr_prefix.as_str())
    }

    /// Live read-only attributes derived from object fields.
    fn reference_xattrs(&self) -> Vec<(String, String)> {
        let state = self.state.lock();
        let md5 = if is_valid_quoted_md5_etag(&state.etag) {
            state.etag.clone()
        } else {
            String::new()
        };

        let mut refs = vec![
            ("__md5__".to_owned(), md5),
            ("__etag__".to_owned(), state.etag.clone()),
            ("__content_type__".to_owned(), state.content_type.clone()),
        ];
        drop(state);

        if let Some(node) = self.file_node() {
            refs.push(("s3fuse_sha256".to_owned(), node.sha256_hash()));
        }

        refs
    }

    /// All visible attribute names, with the configured prefix applied.
    #[must_use]
    pub fn xattr_keys(&self) -> Vec<String> {
        let prefix = &self.context.config.xattr_prefix;
        let mut keys: Vec<String> = self
            .reference_xattrs()
            .into_iter()
            .map(|(key, _)| format!("{prefix}{key}"))
            .collect();

        let state = self.state.lock();
        for attr in state.xattrs.values() {
            if attr.flags().visible {
                keys.push(format!("{prefix}{}", attr.key()));
            }
        }

        keys
    }

    /// Read an attribute value.
    ///
    /// # Errors
    ///
    /// [`Error::NoAttr`] for unknown keys; [`Error::Invalid`] when the
    /// buffer is too small.
    pub fn get_xattr(&self, name: &str, buffer: Option<&mut [u8]>) -> Result<usize> {
        let key = self.strip_xattr_prefix(name).ok_or(Error::NoAttr)?;

        for (ref_key, value) in self.reference_xattrs() {
            if ref_key == key {
                let attr = StaticXattr::from_string(key, &value, XattrFlags::reserved());
                return attr.get_value(buffer);
            }
        }

        let state = self.state.lock();
        let attr = state.xattrs.get(key).ok_or(Error::NoAttr)?;
        attr.get_value(buffer)
    }

    /// Set an attribute. `flags` uses the `XATTR_CREATE`/`XATTR_REPLACE`
    /// convention.
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`] for reserved keys or a foreign prefix,
    /// [`Error::Exists`]/[`Error::NoAttr`] for violated create/replace
    /// constraints.
    pub fn set_xattr(&self, name: &str, value: &[u8], flags: i32) -> Result<()> {
        let key = self
            .strip_xattr_prefix(name)
            .ok_or_else(|| Error::Invalid(format!("xattr key {name} has no user prefix")))?;

        // Applications see these in listxattr and may reasonably try to
        // write them back; fail silently rather than erroring.
        if self
            .reference_xattrs()
            .iter()
            .any(|(ref_key, _)| ref_key == key)
        {
            return Ok(());
        }

        if !is_settable_key(key) {
            return Err(Error::Invalid(format!("xattr key {key} is reserved")));
        }

        let mut state = self.state.lock();
        let exists = state.xattrs.contains_key(key);

        if flags & libc::XATTR_CREATE != 0 && exists {
            return Err(Error::Exists);
        }
        if flags & libc::XATTR_REPLACE != 0 && !exists {
            return Err(Error::NoAttr);
        }

        let attr = state
            .xattrs
            .entry(key.to_owned())
            .or_insert_with(|| StaticXattr::create(key, XattrFlags::user()));
        attr.set_value(value);

        Ok(())
    }

    /// Remove an attribute.
    ///
    /// # Errors
    ///
    /// [`Error::NoAttr`] for unknown or non-removable keys.
    pub fn remove_xattr(&self, name: &str) -> Result<()> {
        let key = self.strip_xattr_prefix(name).ok_or(Error::NoAttr)?;

        let mut state = self.state.lock();
        match state.xattrs.get(key) {
            Some(attr) if attr.flags().removable => {
                state.xattrs.remove(key);
                Ok(())
            }
            _ => Err(Error::NoAttr),
        }
    }
}

// ---------------------------------------------------------------------------
// Type checker registry
// ---------------------------------------------------------------------------

/// A predicate that inspects a HEAD response and either constructs the
/// matching object kind or declines.
pub type TypeChecker =
    fn(context: &Arc<FsContext>, path: &str, request: &Request) -> Option<Arc<Object>>;

/// Priority-ordered object constructors.
pub struct TypeCheckerRegistry {
    checkers: Vec<(i32, TypeChecker)>,
}

impl std::fmt::Debug for TypeCheckerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeCheckerRegistry")
            .field("checkers", &self.checkers.len())
            .finish()
    }
}

impl TypeCheckerRegistry {
    /// The stock registry: directory, encrypted file, FIFO, symlink, and
    /// the regular-file fallback.
    #[must_use]
    pub fn with_stock_checkers() -> Self {
        let mut registry = Self {
            checkers: Vec::new(),
        };

        registry.register(10, |context, path, request| {
            if path.is_empty() || !request.url().ends_with('/') {
                return None;
            }
            Some(Object::new_directory(Arc::clone(context), path))
        });

        registry.register(100, |context, path, request| {
            (request.response_header("content-type") == metadata::ENCRYPTED_CONTENT_TYPE)
                .then(|| Object::new_encrypted_file(Arc::clone(context), path))
        });

        registry.register(150, |context, path, request| {
            (request.response_header("content-type") == metadata::FIFO_CONTENT_TYPE)
                .then(|| Object::new_fifo(Arc::clone(context), path))
        });

        registry.register(200, |context, path, request| {
            (request.response_header("content-type") == metadata::SYMLINK_CONTENT_TYPE)
                .then(|| Object::new_symlink(Arc::clone(context), path))
        });

        registry.register(1000, |context, path, _request| {
            Some(Object::new_file(Arc::clone(context), path))
        });

        registry
    }

    /// Add a checker; lower priorities run first.
    pub fn register(&mut self, priority: i32, checker: TypeChecker) {
        let position = self
            .checkers
            .partition_point(|(existing, _)| *existing <= priority);
        self.checkers.insert(position, (priority, checker));
    }

    /// Construct the object for a successful HEAD response.
    #[must_use]
    pub fn create(
        &self,
        context: &Arc<FsContext>,
        path: &str,
        request: &Request,
    ) -> Option<Arc<Object>> {
        if request.response_code() != status::OK {
            return None;
        }

        for (_, checker) in &self.checkers {
            if let Some(object) = checker(context, path, request) {
                debug!(path, kind = object.type_bits(), "constructed object");
                object.init_from_response(request);
                return Some(object);
            }
        }

        None
    }
}

fn detect_content_type(path: &str) -> Option<String> {
    let extension = path.rsplit('.').next()?;

    let mime = match extension.to_ascii_lowercase().as_str() {
        "css" => mime::TEXT_CSS,
        "csv" => mime::TEXT_CSV,
        "gif" => mime::IMAGE_GIF,
        "htm" | "html" => mime::TEXT_HTML,
        "jpeg" | "jpg" => mime::IMAGE_JPEG,
        "js" => mime::TEXT_JAVASCRIPT,
        "json" => mime::APPLICATION_JSON,
        "pdf" => mime::APPLICATION_PDF,
        "png" => mime::IMAGE_PNG,
        "svg" => mime::IMAGE_SVG,
        "txt" => mime::TEXT_PLAIN,
        "xml" => mime::TEXT_XML,
        _ => return None,
    };

    Some(mime.to_string())
}
