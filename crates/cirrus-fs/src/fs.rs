//! The filesystem façade.
//!
//! [`FsContext`] is the explicit context threaded through the engine
//! (configuration, provider, pools, transfer, store, encryption);
//! [`Filesystem`] owns it together with the metadata cache and the open
//! handle map, and exposes the operations the kernel bridge calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cirrus_core::{Config, Error, Result, Statistics};
use cirrus_services::{FileTransfer, StorageService, TransferConfig, create_service};
use cirrus_transport::{
    HttpMethod, Pool, PoolConfig, Priority, ReqwestTransport, RequestContext, TransportFactory,
    Watchdog, status,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::ObjectCache;
use crate::directory::Directory;
use crate::encryption::Encryption;
use crate::file::{FileNode, OpenMode};
use crate::local::LocalStore;
use crate::object::{Object, ObjectKind, Stat};

/// The explicit engine context threaded through every subsystem.
pub struct FsContext {
    /// Engine configuration.
    pub config: Config,
    /// The storage provider.
    pub service: Arc<dyn StorageService>,
    /// The worker pools.
    pub pool: Arc<Pool>,
    /// The transfer facade.
    pub transfer: Arc<FileTransfer>,
    /// The local backing-file store.
    pub store: Arc<LocalStore>,
    /// Statistics counters.
    pub stats: Arc<Statistics>,
    /// The unlocked encryption context, when enabled.
    pub encryption: Option<Arc<Encryption>>,
}

impl std::fmt::Debug for FsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsContext")
            .field("bucket", &self.config.bucket_name)
            .field("service", &self.config.service)
            .field("encrypted", &self.encryption.is_some())
            .finish_non_exhaustive()
    }
}

/// Builds a [`Filesystem`], with injection points for tests.
pub struct FilesystemBuilder {
    config: Config,
    transport_factory: Option<Arc<TransportFactory>>,
    service: Option<Arc<dyn StorageService>>,
    encryption: Option<Arc<Encryption>>,
}

impl std::fmt::Debug for FilesystemBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemBuilder")
            .field("bucket", &self.config.bucket_name)
            .finish_non_exhaustive()
    }
}

impl FilesystemBuilder {
    /// Start from a configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport_factory: None,
            service: None,
            encryption: None,
        }
    }

    /// Replace the HTTP transport (tests use a scripted one).
    #[must_use]
    pub fn transport_factory(mut self, factory: Arc<TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Replace the provider (skips credential files).
    #[must_use]
    pub fn service(mut self, service: Arc<dyn StorageService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Supply an already unlocked encryption context (skips the
    /// interactive password flow).
    #[must_use]
    pub fn encryption(mut self, encryption: Arc<Encryption>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Assemble the engine: watchdog, provider, pools, transfer facade,
    /// local store, encryption, cache, and monitor thread.
    ///
    /// # Errors
    ///
    /// Configuration validation, credential problems, and (when
    /// encryption is on) volume-key unlock failures.
    pub fn build(self) -> Result<Arc<Filesystem>> {
        let config = self.config;
        config.validate().map_err(Error::Invalid)?;

        let stats = Arc::new(Statistics::new());
        let watchdog = Watchdog::start(Duration::from_secs(1));

        let transport_factory: Arc<TransportFactory> = match self.transport_factory {
            Some(factory) => factory,
            None => {
                // Surface TLS-stack failures now rather than per worker.
                drop(ReqwestTransport::new().map_err(|e| match e {
                    cirrus_transport::TransportError::Fatal(msg) => Error::Invalid(msg),
                    _ => Error::Invalid("transport initialization failed".to_owned()),
                })?);
                Arc::new(|| {
                    Box::new(ReqwestTransport::new().expect("transport initialization failed"))
                        as Box<dyn cirrus_transport::HttpTransport>
                })
            }
        };

        let boxed_factory = |factory: &Arc<TransportFactory>| -> Box<TransportFactory> {
            let factory = Arc::clone(factory);
            Box::new(move || factory())
        };

        let service = match self.service {
            Some(service) => service,
            None => create_service(&config, boxed_factory(&transport_factory), &watchdog)?,
        };

        let request_context = Arc::new(RequestContext {
            transport_factory: boxed_factory(&transport_factory),
            hook: Some(service.hook()),
            watchdog: Arc::clone(&watchdog),
            max_transfer_retries: config.max_transfer_retries,
            default_timeout: Duration::from_secs(config.request_timeout_seconds),
            verbose: config.verbose_requests,
        });

        let pool = Pool::start(
            PoolConfig {
                max_transfer_retries: config.max_transfer_retries,
                ..PoolConfig::default()
            },
            Arc::clone(&request_context),
        );

        let transfer = Arc::new(FileTransfer::new(
            Arc::clone(&pool),
            service.multipart(),
            TransferConfig::from_config(&config),
        ));

        let store = LocalStore::new(&config, Arc::clone(&stats));

        // The volume-key unlock needs a context of its own before the
        // real one can be assembled with the unlocked key inside.
        let encryption = match self.encryption {
            Some(encryption) => Some(encryption),
            None if config.use_encryption => {
                let bootstrap = Arc::new(FsContext {
                    config: config.clone(),
                    service: Arc::clone(&service),
                    pool: Arc::clone(&pool),
                    transfer: Arc::clone(&transfer),
                    store: Arc::clone(&store),
                    stats: Arc::clone(&stats),
                    encryption: None,
                });
                Encryption::init(&bootstrap, &pool)?
            }
            None => None,
        };

        let context = Arc::new(FsContext {
            config,
            service,
            pool: Arc::clone(&pool),
            transfer,
            store: Arc::clone(&store),
            stats,
            encryption,
        });

        let cache = ObjectCache::new(Arc::clone(&context));
        store.start_monitor(Arc::clone(&cache));

        Ok(Arc::new(Filesystem {
            context,
            cache,
            watchdog,
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
            terminated: Mutex::new(false),
        }))
    }
}

/// The mounted filesystem engine.
pub struct Filesystem {
    context: Arc<FsContext>,
    cache: Arc<ObjectCache>,
    watchdog: Arc<Watchdog>,
    handles: DashMap<u64, Arc<Object>>,
    next_handle: AtomicU64,
    terminated: Mutex<bool>,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("context", &self.context)
            .field("open_handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    /// The engine context.
    #[must_use]
    pub fn context(&self) -> &Arc<FsContext> {
        &self.context
    }

    /// The metadata cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    fn object(&self, path: &str) -> Result<Arc<Object>> {
        self.cache.get(path).ok_or(Error::NotFound)
    }

    fn handle_object(&self, handle: u64) -> Result<Arc<Object>> {
        self.handles
            .get(&handle)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::Invalid(format!("unknown file handle {handle}")))
    }

    fn commit_object(&self, object: &Arc<Object>) -> Result<()> {
        let commit_object = Arc::clone(object);
        self.context.pool.call(
            Priority::PrReq0,
            Box::new(move |request| commit_object.commit(request)),
        )
    }

    // -- metadata operations -----------------------------------------------

    /// Stat a path.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for missing objects.
    pub fn get_stats(&self, path: &str) -> Result<Stat> {
        Ok(self.object(path)?.stat())
    }

    /// Change permission bits.
    ///
    /// # Errors
    ///
    /// Lookup and commit failures.
    pub fn change_mode(&self, path: &str, mode: u32) -> Result<()> {
        let object = self.object(path)?;
        object.set_mode(mode);
        self.commit_object(&object)
    }

    /// Change ownership; `u32::MAX` leaves a field untouched.
    ///
    /// # Errors
    ///
    /// Lookup and commit failures.
    pub fn change_owner(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let object = self.object(path)?;
        if uid != u32::MAX {
            object.set_uid(uid);
        }
        if gid != u32::MAX {
            object.set_gid(gid);
        }
        self.commit_object(&object)
    }

    /// Change the modification time.
    ///
    /// # Errors
    ///
    /// Lookup and commit failures.
    pub fn change_mtime(&self, path: &str, mtime: i64) -> Result<()> {
        let object = self.object(path)?;
        object.set_mtime(mtime);
        self.commit_object(&object)
    }

    // -- creation ----------------------------------------------------------

    fn create_object(&self, object: &Arc<Object>, body: &[u8]) -> Result<()> {
        self.cache.invalidate_parent(object.path());

        let create_object = Arc::clone(object);
        let body = body.to_vec();
        self.context.pool.call(
            Priority::PrReq0,
            Box::new(move |request| create_object.create_remote(request, &body)),
        )?;

        self.cache.insert(object);
        Ok(())
    }

    /// Create an empty regular file.
    ///
    /// # Errors
    ///
    /// [`Error::Exists`] when the path is taken.
    pub fn create_file(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<()> {
        if self.cache.get(path).is_some() {
            warn!(path, "attempt to overwrite object");
            return Err(Error::Exists);
        }

        let object = if self.context.encryption.is_some() {
            Object::new_encrypted_file(Arc::clone(&self.context), path)
        } else {
            Object::new_file(Arc::clone(&self.context), path)
        };
        object.set_mode(mode);
        object.set_uid(uid);
        object.set_gid(gid);

        self.create_object(&object, b"")
    }

    /// Create a directory marker.
    ///
    /// # Errors
    ///
    /// [`Error::Exists`] when the path is taken.
    pub fn create_directory(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<()> {
        if self.cache.get(path).is_some() {
            return Err(Error::Exists);
        }

        let object = Object::new_directory(Arc::clone(&self.context), path);
        object.set_mode(mode);
        object.set_uid(uid);
        object.set_gid(gid);

        self.create_object(&object, b"")
    }

    /// Create a symlink whose body is `target`.
    ///
    /// # Errors
    ///
    /// [`Error::Exists`] when the path is taken.
    pub fn create_symlink(&self, path: &str, uid: u32, gid: u32, target: &str) -> Result<()> {
        if self.cache.get(path).is_some() {
            return Err(Error::Exists);
        }

        let object = Object::new_symlink(Arc::clone(&self.context), path);
        object.set_uid(uid);
        object.set_gid(gid);

        if let ObjectKind::Symlink(slot) = object.kind() {
            *slot.lock() = Some(target.to_owned());
        }

        self.create_object(&object, target.as_bytes())
    }

    /// Create a FIFO marker.
    ///
    /// # Errors
    ///
    /// [`Error::Exists`] when the path is taken.
    pub fn create_fifo(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<()> {
        if self.cache.get(path).is_some() {
            return Err(Error::Exists);
        }

        let object = Object::new_fifo(Arc::clone(&self.context), path);
        object.set_mode(mode);
        object.set_uid(uid);
        object.set_gid(gid);

        self.create_object(&object, b"")
    }

    // -- removal -----------------------------------------------------------

    fn remove_object(&self, object: &Arc<Object>) -> Result<()> {
        let remove_object = Arc::clone(object);
        self.context.pool.call(
            Priority::PrReq0,
            Box::new(move |request| remove_object.remove(request)),
        )?;

        self.cache.remove(object.path());
        self.cache.invalidate_parent(object.path());
        Ok(())
    }

    /// Unlink a non-directory.
    ///
    /// # Errors
    ///
    /// [`Error::IsDir`] for directories.
    pub fn remove_file(&self, path: &str) -> Result<()> {
        let object = self.object(path)?;
        if object.dir_node().is_some() {
            return Err(Error::IsDir);
        }
        self.remove_object(&object)
    }

    /// Remove an empty directory.
    ///
    /// # Errors
    ///
    /// [`Error::NotDir`] for non-directories, [`Error::NotEmpty`] for
    /// populated ones.
    pub fn remove_directory(&self, path: &str) -> Result<()> {
        let object = self.object(path)?;
        if object.dir_node().is_none() {
            return Err(Error::NotDir);
        }
        if !Directory::is_empty(&object) {
            return Err(Error::NotEmpty);
        }
        self.remove_object(&object)
    }

    // -- rename ------------------------------------------------------------

    /// Rename `from` to `to` (copy-then-delete underneath).
    ///
    /// # Errors
    ///
    /// POSIX type-mismatch errors ([`Error::IsDir`], [`Error::NotDir`],
    /// [`Error::NotEmpty`]), [`Error::NotFound`] for a missing source.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Ok(());
        }

        let source = self.object(from)?;
        let source_is_dir = source.dir_node().is_some();

        if let Some(target) = self.cache.get(to) {
            let target_is_dir = target.dir_node().is_some();

            match (source_is_dir, target_is_dir) {
                (true, false) => return Err(Error::NotDir),
                (false, true) => return Err(Error::IsDir),
                (true, true) => {
                    if !Directory::is_empty(&target) {
                        return Err(Error::NotEmpty);
                    }
                    self.remove_object(&target)?;
                }
                (false, false) => {
                    self.remove_object(&target)?;
                }
            }
        }

        if source_is_dir {
            Directory::rename(&self.context, &self.cache, from, to)?;
        } else {
            let copy_source = Arc::clone(&source);
            let to_owned = to.to_owned();
            self.context.pool.call(
                Priority::PrReq0,
                Box::new(move |request| copy_source.copy_to(request, &to_owned)),
            )?;

            let delete_source = Arc::clone(&source);
            self.context.pool.call(
                Priority::PrReq0,
                Box::new(move |request| delete_source.remove(request)),
            )?;
        }

        self.cache.remove(from);
        self.cache.remove(to);
        self.cache.invalidate_parent(from);
        self.cache.invalidate_parent(to);
        Ok(())
    }

    // -- directories & symlinks --------------------------------------------

    /// List a directory into `filler`.
    ///
    /// # Errors
    ///
    /// [`Error::NotDir`] for non-directories, listing failures.
    pub fn read_directory(&self, path: &str, filler: &mut dyn FnMut(&str)) -> Result<()> {
        let object = self.object(path)?;
        if object.dir_node().is_none() {
            return Err(Error::NotDir);
        }
        Directory::read(&object, &self.cache, filler)
    }

    /// Read a symlink target.
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`] for non-symlinks, transfer failures.
    pub fn read_symlink(&self, path: &str) -> Result<String> {
        let object = self.object(path)?;

        let ObjectKind::Symlink(slot) = object.kind() else {
            return Err(Error::Invalid(format!("{path} is not a symlink")));
        };

        if let Some(target) = slot.lock().clone() {
            return Ok(target);
        }

        let fetch_object = Arc::clone(&object);
        let target: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let target_out = Arc::clone(&target);

        self.context.pool.call(
            Priority::PrReq0,
            Box::new(move |request| {
                request.init(HttpMethod::Get);
                request.set_url(fetch_object.url(), "");
                request.run(None)?;

                match request.response_code() {
                    status::OK => {
                        *target_out.lock() = request.output_string();
                        Ok(())
                    }
                    status::NOT_FOUND => Err(Error::NotFound),
                    code => Err(Error::Http(code)),
                }
            }),
        )?;

        let target = target.lock().clone();
        *slot.lock() = Some(target.clone());
        Ok(target)
    }

    // -- xattrs ------------------------------------------------------------

    /// List visible attribute names.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for missing objects.
    pub fn list_xattrs(&self, path: &str) -> Result<Vec<String>> {
        Ok(self.object(path)?.xattr_keys())
    }

    /// Read an attribute.
    ///
    /// # Errors
    ///
    /// See [`Object::get_xattr`].
    pub fn get_xattr(&self, path: &str, name: &str, buffer: Option<&mut [u8]>) -> Result<usize> {
        self.object(path)?.get_xattr(name, buffer)
    }

    /// Set an attribute and commit the metadata.
    ///
    /// # Errors
    ///
    /// See [`Object::set_xattr`]; commit failures.
    pub fn set_xattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> Result<()> {
        let object = self.object(path)?;
        object.set_xattr(name, value, flags)?;
        self.commit_object(&object)
    }

    /// Remove an attribute and commit the metadata.
    ///
    /// # Errors
    ///
    /// See [`Object::remove_xattr`]; commit failures.
    pub fn remove_xattr(&self, path: &str, name: &str) -> Result<()> {
        let object = self.object(path)?;
        object.remove_xattr(name)?;
        self.commit_object(&object)
    }

    // -- open files --------------------------------------------------------

    /// Open a file; returns the handle.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for missing paths (including `O_TRUNC`
    /// opens), [`Error::IsDir`] for directories.
    pub fn open(&self, path: &str, mode: OpenMode) -> Result<u64> {
        let object = self.cache.lock_object(path, |object| {
            let object = object.ok_or(Error::NotFound)?;

            match object.kind() {
                ObjectKind::File(_) => {}
                ObjectKind::Directory(_) => return Err(Error::IsDir),
                _ => return Err(Error::Invalid(format!("cannot open {path}"))),
            }

            FileNode::open(object, mode)?;
            Ok(Arc::clone(object))
        })?;

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(handle, object);
        debug!(path, handle, "opened file");
        Ok(handle)
    }

    /// Create a file and open it (the `create` callback).
    ///
    /// # Errors
    ///
    /// [`Error::Exists`] when the path is taken; open failures.
    pub fn create_and_open(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<u64> {
        self.create_file(path, mode, uid, gid)?;
        self.open(path, OpenMode::Default)
    }

    /// Read from an open file.
    ///
    /// # Errors
    ///
    /// The file's latched transfer error; I/O failures.
    pub fn read(&self, handle: u64, buf: &mut [u8], offset: u64) -> Result<usize> {
        FileNode::read(&self.handle_object(handle)?, buf, offset)
    }

    /// Write to an open file.
    ///
    /// # Errors
    ///
    /// The file's latched transfer error; I/O failures.
    pub fn write(&self, handle: u64, data: &[u8], offset: u64) -> Result<usize> {
        FileNode::write(&self.handle_object(handle)?, data, offset)
    }

    /// Truncate an open file.
    ///
    /// # Errors
    ///
    /// The file's latched transfer error; I/O failures.
    pub fn ftruncate(&self, handle: u64, len: u64) -> Result<()> {
        FileNode::truncate(&self.handle_object(handle)?, len)
    }

    /// Flush an open file (upload if dirty).
    ///
    /// # Errors
    ///
    /// Upload and commit failures (also latched on the file).
    pub fn flush(&self, handle: u64) -> Result<()> {
        FileNode::flush(&self.handle_object(handle)?)
    }

    /// Release an open handle.
    ///
    /// # Errors
    ///
    /// [`Error::State`] when released mid-transfer.
    pub fn release(&self, handle: u64) -> Result<()> {
        let (_, object) = self
            .handles
            .remove(&handle)
            .ok_or_else(|| Error::Invalid(format!("unknown file handle {handle}")))?;
        FileNode::release(&object)
    }

    /// Truncate by path: open, truncate, flush, release.
    ///
    /// # Errors
    ///
    /// Open, truncate, or flush failures.
    pub fn truncate_path(&self, path: &str, len: u64) -> Result<()> {
        let handle = self.open(path, OpenMode::Default)?;

        let result = self
            .ftruncate(handle, len)
            .and_then(|()| self.flush(handle));

        let release_result = self.release(handle);
        result.and(release_result)
    }

    // -- lifecycle ---------------------------------------------------------

    /// Shut down the engine: stop the monitor, drain the pools, stop the
    /// watchdog, and write the statistics report.
    pub fn terminate(&self) {
        let mut terminated = self.terminated.lock();
        if *terminated {
            return;
        }
        *terminated = true;

        self.context.store.terminate();
        self.context.pool.terminate();
        self.watchdog.terminate();

        if let Err(error) = self
            .context
            .stats
            .write_to_file(&self.context.config.stats_file)
        {
            warn!(%error, "failed to write statistics file");
        }
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        self.terminate();
    }
}
