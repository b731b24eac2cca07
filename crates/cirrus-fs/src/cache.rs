//! The object metadata cache.
//!
//! A path-keyed map of objects with TTL expiry and per-path locking.
//! `lock_object` is the concurrency keystone: it guarantees the callback
//! runs against the one object currently cached for a path, so two
//! threads can never mutate different instances of the same object.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use cirrus_core::{Error, Result};
use cirrus_transport::{HttpMethod, Priority, Request, status};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::fs::FsContext;
use crate::object::{Object, TypeCheckerRegistry};

/// What the caller already knows about the path being fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHint {
    /// Nothing: probe the directory URL first, then the file URL.
    None,
    /// The path names a directory.
    IsDir,
    /// The path names a file-like object.
    IsFile,
}

struct Entry {
    object: Arc<Object>,
    inserted: Instant,
}

/// Path-keyed object cache.
pub struct ObjectCache {
    me: Weak<ObjectCache>,
    context: Arc<FsContext>,
    registry: TypeCheckerRegistry,
    entries: Mutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("entries", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl ObjectCache {
    /// Create the cache with the stock type-checker registry.
    #[must_use]
    pub fn new(context: Arc<FsContext>) -> Arc<Self> {
        Self::with_registry(context, TypeCheckerRegistry::with_stock_checkers())
    }

    /// Create the cache with a custom registry.
    #[must_use]
    pub fn with_registry(context: Arc<FsContext>, registry: TypeCheckerRegistry) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            context,
            registry,
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("cache is alive while in use")
    }

    fn find(&self, path: &str) -> Option<Arc<Object>> {
        let stats = &self.context.stats;
        let mut entries = self.entries.lock();

        match entries.get(path) {
            None => {
                stats.counter("object_cache.misses").incr();
                None
            }
            Some(entry) if entry.object.is_expired() => {
                stats.counter("object_cache.expiries").incr();
                entries.remove(path);
                None
            }
            Some(entry) => {
                stats.counter("object_cache.hits").incr();
                Some(Arc::clone(&entry.object))
            }
        }
    }

    /// HEAD the path and construct the matching object. Runs on the
    /// caller-facing request pool.
    fn fetch(&self, path: &str, hint: CacheHint) -> Option<Arc<Object>> {
        let cache = self.arc();
        let path_owned = path.to_owned();
        let slot: Arc<Mutex<Option<Arc<Object>>>> = Arc::new(Mutex::new(None));
        let slot_out = Arc::clone(&slot);

        let result = self.context.pool.call(
            Priority::PrReq0,
            Box::new(move |request| {
                *slot_out.lock() = cache.fetch_with_request(request, &path_owned, hint)?;
                Ok(())
            }),
        );

        if let Err(error) = result {
            if !matches!(error, Error::NotFound) {
                warn!(path, %error, "object fetch failed");
            }
            return None;
        }

        let object = slot.lock().take();
        object.map(|object| self.insert_or_existing(path, object))
    }

    /// Probe the candidate URLs for `path` on the caller's request.
    ///
    /// # Errors
    ///
    /// Transfer failures; a clean miss is `Ok(None)`.
    pub(crate) fn fetch_with_request(
        &self,
        request: &mut Request,
        path: &str,
        hint: CacheHint,
    ) -> Result<Option<Arc<Object>>> {
        let urls: &[String] = &match hint {
            CacheHint::IsDir => vec![Object::build_directory_url(&self.context, path)],
            CacheHint::IsFile => vec![Object::build_url(&self.context, path)],
            CacheHint::None => vec![
                Object::build_directory_url(&self.context, path),
                Object::build_url(&self.context, path),
            ],
        };

        for url in urls {
            request.init(HttpMethod::Head);
            request.set_url(url, "");
            request.run(None)?;

            match request.response_code() {
                status::OK => {
                    return Ok(self.registry.create(&self.context, path, request));
                }
                status::NOT_FOUND => {}
                code => return Err(Error::Http(code)),
            }
        }

        Ok(None)
    }

    fn insert_or_existing(&self, path: &str, object: Arc<Object>) -> Arc<Object> {
        let mut entries = self.entries.lock();

        // Never replace a concurrently inserted object; the cache must
        // hold at most one instance per path.
        match entries.get(path) {
            Some(existing) if !existing.object.is_expired() => Arc::clone(&existing.object),
            _ => {
                entries.insert(
                    path.to_owned(),
                    Entry {
                        object: Arc::clone(&object),
                        inserted: Instant::now(),
                    },
                );
                object
            }
        }
    }

    /// Insert a freshly created object (create/mkdir/symlink paths).
    pub fn insert(&self, object: &Arc<Object>) {
        self.insert_or_existing(object.path(), Arc::clone(object));
    }

    /// Look up `path`, synchronously populating from a HEAD on a miss.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Arc<Object>> {
        self.get_hinted(path, CacheHint::None)
    }

    /// Look up with a type hint that skips the wrong-URL probe.
    #[must_use]
    pub fn get_hinted(&self, path: &str, hint: CacheHint) -> Option<Arc<Object>> {
        self.find(path)
            .or_else(|| self.fetch(path, hint))
    }

    /// Run `callback` against the one cached object for `path`.
    ///
    /// The path is first populated (like `get`), then the map lock is
    /// held across the callback so no other thread can swap the entry
    /// between lookup and use. The callback may see `None` if the entry
    /// was pruned in between.
    pub fn lock_object<R>(
        &self,
        path: &str,
        callback: impl FnOnce(Option<&Arc<Object>>) -> R,
    ) -> R {
        let _ = self.get(path);

        let entries = self.entries.lock();
        callback(entries.get(path).map(|entry| &entry.object))
    }

    /// Evict `path` immediately.
    pub fn remove(&self, path: &str) {
        self.entries.lock().remove(path);
    }

    /// Evict the parent directory of `path` so the next readdir
    /// refreshes its memoized listing.
    pub fn invalidate_parent(&self, path: &str) {
        if self.context.config.cache_directories {
            let parent = cirrus_core::parent_path(path);
            debug!(parent, path, "invalidating parent directory");
            self.remove(parent);
        }
    }

    /// Drop expired, removable entries.
    pub fn sweep(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !(entry.object.is_expired() && entry.object.is_removable()));
    }

    /// All cached objects, oldest insertion first (the purge order of
    /// the local store).
    #[must_use]
    pub fn entries_oldest_first(&self) -> Vec<Arc<Object>> {
        let entries = self.entries.lock();
        let mut objects: Vec<(Instant, Arc<Object>)> = entries
            .values()
            .map(|entry| (entry.inserted, Arc::clone(&entry.object)))
            .collect();
        objects.sort_by_key(|(inserted, _)| *inserted);
        objects.into_iter().map(|(_, object)| object).collect()
    }

    /// The engine context.
    #[must_use]
    pub fn context(&self) -> &Arc<FsContext> {
        &self.context
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
