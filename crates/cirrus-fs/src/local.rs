//! Local backing files and the size-capped store that owns them.
//!
//! Backing files are anonymous temp files in the configured store
//! directory (created and immediately unlinked, so a crash leaks
//! nothing). The store keeps a running byte counter; a monitor thread
//! purges the oldest closed files whenever the counter passes the
//! high-water mark, aiming for 90% of it.

use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cirrus_core::{Config, Error, Result, Statistics};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::ObjectCache;

const PURGE_ADJUSTMENT: f64 = 0.9;

/// The local backing-file store.
pub struct LocalStore {
    path: PathBuf,
    max_size: u64,
    purge_period: Duration,
    persistence: bool,
    size: Mutex<u64>,
    stats: Arc<Statistics>,
    stop: AtomicBool,
    monitor: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Create the store from configuration.
    #[must_use]
    pub fn new(config: &Config, stats: Arc<Statistics>) -> Arc<Self> {
        Arc::new(Self {
            path: PathBuf::from(&config.local_store_path),
            max_size: config.max_local_store_size,
            purge_period: Duration::from_secs(config.local_store_purge_period.max(1)),
            persistence: config.enable_local_store_persistence,
            size: Mutex::new(0),
            stats,
            stop: AtomicBool::new(false),
            monitor: Mutex::new(None),
        })
    }

    /// The directory backing files are created in.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Whether backing files survive close/open cycles.
    #[must_use]
    pub fn persistence_enabled(&self) -> bool {
        self.persistence
    }

    /// Total bytes currently backed.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        *self.size.lock()
    }

    pub(crate) fn increment(&self, bytes: u64) {
        let mut size = self.size.lock();
        *size += bytes;
        self.stats.counter("local_store.bytes_allocated").add(bytes);
    }

    pub(crate) fn decrement(&self, bytes: u64) {
        let mut size = self.size.lock();
        *size = size.saturating_sub(bytes);
    }

    /// Start the monitor thread purging `cache`'s stale backing files.
    pub fn start_monitor(self: &Arc<Self>, cache: Arc<ObjectCache>) {
        let store = Arc::clone(self);

        let thread = std::thread::Builder::new()
            .name("cirrus-store-monitor".to_owned())
            .spawn(move || {
                while !store.stop.load(Ordering::SeqCst) {
                    std::thread::sleep(store.purge_period);
                    if store.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    cache.sweep();
                    store.purge_stale(&cache);
                }
            })
            .expect("failed to spawn store monitor");

        *self.monitor.lock() = Some(thread);
    }

    /// Purge closed backing files, oldest first, until the store drops
    /// below 90% of the high-water mark.
    pub fn purge_stale(&self, cache: &ObjectCache) {
        if self.max_size == 0 {
            return;
        }

        let starting_size = self.total_size();
        if starting_size < self.max_size {
            return;
        }

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let target = (self.max_size as f64 * PURGE_ADJUSTMENT) as u64;
        let mut purged = 0u64;

        for object in cache.entries_oldest_first() {
            if self.total_size() <= target {
                break;
            }

            if let Some(node) = object.file_node() {
                if !node.is_open() {
                    purged += node.local_size().unwrap_or(0);
                    node.purge(&object);
                }
            }
        }

        self.stats.counter("local_store.bytes_purged").add(purged);
        debug!(
            starting_size,
            target,
            ending_size = self.total_size(),
            "local store purge pass"
        );
    }

    /// Stop the monitor thread.
    pub fn terminate(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.monitor.lock().take() {
            let _ = thread.join();
        }

        let leftover = self.total_size();
        if leftover > 0 {
            warn!(leftover, "local store is not empty after purging");
        }
    }
}

/// One anonymous backing file.
pub struct LocalFile {
    file: std::fs::File,
    tracked_size: Mutex<u64>,
    store: Arc<LocalStore>,
}

impl std::fmt::Debug for LocalFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFile")
            .field("tracked_size", &*self.tracked_size.lock())
            .finish_non_exhaustive()
    }
}

impl LocalFile {
    /// Create a backing file of `size` bytes in the store directory.
    ///
    /// # Errors
    ///
    /// I/O failures creating or sizing the file.
    pub fn new(store: &Arc<LocalStore>, size: u64) -> Result<Self> {
        let file = tempfile::tempfile_in(store.path()).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to open file in local store: {e}"),
            ))
        })?;

        file.set_len(size)?;
        store.increment(size);

        Ok(Self {
            file,
            tracked_size: Mutex::new(size),
            store: Arc::clone(store),
        })
    }

    /// The current on-disk size.
    ///
    /// # Errors
    ///
    /// Propagates `fstat` failures.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Truncate (or extend) to `len` bytes.
    ///
    /// # Errors
    ///
    /// Propagates `ftruncate` failures.
    pub fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Positional read; returns the bytes read.
    ///
    /// # Errors
    ///
    /// Propagates `pread` failures.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    /// Positional read of exactly `buf.len()` bytes.
    ///
    /// # Errors
    ///
    /// Propagates `pread` failures, including a short file.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Positional write; returns the bytes written.
    ///
    /// # Errors
    ///
    /// Propagates `pwrite` failures.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Ok(self.file.write_at(buf, offset)?)
    }

    /// Positional write of the whole buffer.
    ///
    /// # Errors
    ///
    /// Propagates `pwrite` failures.
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Re-read the on-disk size into the store counter (sizes change
    /// through writes and truncation).
    pub fn refresh_store_size(&self) {
        let Ok(current) = self.size() else { return };

        let mut tracked = self.tracked_size.lock();
        self.store.decrement(*tracked);
        self.store.increment(current);
        *tracked = current;
    }

    /// Quoted-hex MD5 of the whole file.
    ///
    /// # Errors
    ///
    /// Propagates read failures.
    pub fn md5(&self) -> Result<String> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        Ok(cirrus_crypto::md5_file(&mut file)?)
    }
}

impl Drop for LocalFile {
    fn drop(&mut self) {
        self.store.decrement(*self.tracked_size.lock());
    }
}
