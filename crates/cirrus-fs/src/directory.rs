//! Directory listing, emptiness checks, and subtree rename.

use std::sync::Arc;

use cirrus_core::{Error, Result};
use cirrus_transport::{ParallelWorkQueue, Priority, Request};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::{CacheHint, ObjectCache};
use crate::fs::FsContext;
use crate::list_reader::ListReader;
use crate::metadata;
use crate::object::{self, Object};

#[derive(Debug, Clone)]
struct Child {
    name: String,
    is_dir: bool,
}

/// Per-directory state: the optional memoized child-name list.
#[derive(Debug, Default)]
pub struct DirNode {
    cached_names: Mutex<Option<Vec<String>>>,
}

impl DirNode {
    /// Invalidate the memoized listing.
    pub fn clear(&self) {
        *self.cached_names.lock() = None;
    }
}

/// Directory operations over the bucket lister.
#[derive(Debug)]
pub struct Directory;

impl Directory {
    /// List the children of `object`, feeding each relative name to
    /// `filler`.
    ///
    /// Common prefixes lose their trailing slash; the directory's own
    /// marker and internal objects are skipped. When configured, each
    /// child is pre-cached with an async HEAD (failures are swallowed and
    /// logged) and the name list is memoized on the directory.
    ///
    /// # Errors
    ///
    /// Listing transfer failures.
    pub fn read(
        object: &Arc<Object>,
        cache: &Arc<ObjectCache>,
        filler: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let node = object.dir_node().ok_or(Error::NotDir)?;
        let context = object.context();

        if let Some(names) = node.cached_names.lock().clone() {
            for name in &names {
                filler(name);
            }
            return Ok(());
        }

        let prefix = if object.path().is_empty() {
            String::new()
        } else {
            format!("{}/", object.path())
        };

        let children = Self::list_children(context, &prefix)?;

        for child in &children {
            filler(&child.name);
        }

        if context.config.precache_on_readdir {
            for child in &children {
                let hint = if child.is_dir {
                    CacheHint::IsDir
                } else {
                    CacheHint::IsFile
                };
                Self::precache(cache, &format!("{prefix}{}", child.name), hint);
            }
        }

        if context.config.cache_directories {
            *node.cached_names.lock() =
                Some(children.into_iter().map(|child| child.name).collect());
        }

        Ok(())
    }

    fn list_children(context: &Arc<FsContext>, prefix: &str) -> Result<Vec<Child>> {
        let context_clone = Arc::clone(context);
        let prefix_owned = prefix.to_owned();
        let children: Arc<Mutex<Vec<Child>>> = Arc::new(Mutex::new(Vec::new()));
        let children_out = Arc::clone(&children);

        context.pool.call(
            Priority::PrReq0,
            Box::new(move |request| {
                let mut reader = ListReader::new(&prefix_owned, true, None);
                let mut keys = Vec::new();
                let mut prefixes = Vec::new();
                let mut collected = Vec::new();

                loop {
                    let count = reader.read(
                        &context_clone,
                        request,
                        &mut keys,
                        Some(&mut prefixes),
                    )?;
                    if count == 0 {
                        break;
                    }

                    for common_prefix in &prefixes {
                        // Strip the listing prefix and the trailing slash.
                        let relative =
                            &common_prefix[prefix_owned.len()..common_prefix.len() - 1];
                        collected.push(Child {
                            name: relative.to_owned(),
                            is_dir: true,
                        });
                    }

                    for key in &keys {
                        if *key == prefix_owned {
                            continue; // the directory's own marker
                        }
                        let relative = &key[prefix_owned.len()..];
                        if metadata::is_internal_path(relative) {
                            context_clone
                                .stats
                                .counter("directory.internal_objects_skipped")
                                .incr();
                            continue;
                        }
                        collected.push(Child {
                            name: relative.to_owned(),
                            is_dir: false,
                        });
                    }
                }

                *children_out.lock() = collected;
                Ok(())
            }),
        )?;

        let collected = children.lock().clone();
        Ok(collected)
    }

    /// Warm the metadata cache for `path` without blocking or surfacing
    /// errors.
    fn precache(cache: &Arc<ObjectCache>, path: &str, hint: CacheHint) {
        let cache = Arc::clone(cache);
        let path = path.to_owned();
        let pool = Arc::clone(&cache.context().pool);

        pool.call_async(
            Priority::PrReq1,
            Box::new(move |request| {
                match cache.fetch_with_request(request, &path, hint) {
                    Ok(Some(object)) => {
                        cache.insert(&object);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        // Precache is advisory; the readdir caller never
                        // sees these.
                        debug!(path = %path, %error, "precache failed");
                    }
                }
                Ok(())
            }),
        );
    }

    /// Whether the directory has no children. The root is never empty.
    #[must_use]
    pub fn is_empty(object: &Arc<Object>) -> bool {
        if object.path().is_empty() {
            return false;
        }

        let context = object.context();
        let context_clone = Arc::clone(context);
        let prefix = format!("{}/", object.path());
        let empty = Arc::new(Mutex::new(false));
        let empty_out = Arc::clone(&empty);

        // max-keys=2: the marker itself always comes back, so an empty
        // directory returns exactly one key.
        let result = context.pool.call(
            Priority::PrReq0,
            Box::new(move |request| {
                let mut reader = ListReader::new(&prefix, false, Some(2));
                let mut keys = Vec::new();
                reader.read(&context_clone, request, &mut keys, None)?;
                *empty_out.lock() = keys.len() == 1;
                Ok(())
            }),
        );

        // On failure, assume non-empty: the safe answer for rmdir.
        match result {
            Ok(()) => {
                let empty = *empty.lock();
                empty
            }
            Err(error) => {
                warn!(%error, "emptiness check failed");
                false
            }
        }
    }

    /// List the internal objects (reserved prefix), names stripped of the
    /// prefix.
    ///
    /// # Errors
    ///
    /// Listing transfer failures.
    pub fn get_internal_objects(context: &Arc<FsContext>) -> Result<Vec<String>> {
        let names = Self::list_keys_flat(context, metadata::INTERNAL_OBJECT_PREFIX)?;
        Ok(names
            .into_iter()
            .map(|key| key[metadata::INTERNAL_OBJECT_PREFIX.len()..].to_owned())
            .collect())
    }

    fn list_keys_flat(context: &Arc<FsContext>, prefix: &str) -> Result<Vec<String>> {
        let context_clone = Arc::clone(context);
        let prefix_owned = prefix.to_owned();
        let keys_slot: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let keys_out = Arc::clone(&keys_slot);

        context.pool.call(
            Priority::PrReq0,
            Box::new(move |request| {
                let mut reader = ListReader::new(&prefix_owned, false, None);
                let mut keys = Vec::new();
                let mut collected = Vec::new();

                while reader.read(&context_clone, request, &mut keys, None)? > 0 {
                    collected.extend(keys.iter().cloned());
                }

                *keys_out.lock() = collected;
                Ok(())
            }),
        )?;

        let keys = keys_slot.lock().clone();
        Ok(keys)
    }

    /// Rename the subtree at `from_path` to `to_path`: parallel copies of
    /// every descendant, then (only if every copy succeeded) parallel
    /// deletes of the sources.
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`] for the root, transfer failures otherwise. A
    /// failed copy leaves the source subtree intact.
    pub fn rename(
        context: &Arc<FsContext>,
        cache: &ObjectCache,
        from_path: &str,
        to_path: &str,
    ) -> Result<()> {
        if from_path.is_empty() {
            return Err(Error::Invalid("cannot rename the root".to_owned()));
        }

        let from_prefix = format!("{from_path}/");
        let to_prefix = format!("{to_path}/");

        let keys = Self::list_keys_flat(context, &from_prefix)?;

        for key in &keys {
            cache.remove(key);
        }

        // Pass 1: copy everything.
        let copies: Vec<(String, String)> = keys
            .iter()
            .map(|key| {
                let relative = &key[from_prefix.len()..];
                (key.clone(), format!("{to_prefix}{relative}"))
            })
            .collect();

        for (from, to) in &copies {
            debug!(%from, %to, "renaming");
        }

        let copy_context = Arc::clone(context);
        let copy_queue = ParallelWorkQueue::new(
            copies.clone(),
            Arc::new(move |request: &mut Request, part: &(String, String), _is_retry| {
                object::copy_by_path(&copy_context, request, &part.0, &part.1)
            }),
            context.config.max_transfer_retries,
            context.config.max_parts_in_progress,
        );
        copy_queue.process(&context.pool)?;

        // Pass 2: delete the sources.
        let delete_context = Arc::clone(context);
        let delete_queue = ParallelWorkQueue::new(
            copies,
            Arc::new(move |request: &mut Request, part: &(String, String), _is_retry| {
                let url = Object::build_url(&delete_context, &part.0);
                object::remove_by_url(request, &url)
            }),
            context.config.max_transfer_retries,
            context.config.max_parts_in_progress,
        );
        delete_queue.process(&context.pool)
    }

    /// Create the directory marker object for `path`.
    ///
    /// # Errors
    ///
    /// Transfer failures.
    pub fn create_marker(object: &Arc<Object>) -> Result<()> {
        let context = object.context();
        let create_object = Arc::clone(object);

        context.pool.call(
            Priority::PrReq0,
            Box::new(move |request| create_object.create_remote(request, b"")),
        )
    }

}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use cirrus_transport::TransportResponse;

    use super::*;
    use crate::fs::tests_support::test_context_with_handler;

    fn list_page(keys: &[&str], prefixes: &[&str]) -> Vec<u8> {
        let mut xml = String::from("<ListBucketResult><IsTruncated>false</IsTruncated>");
        for key in keys {
            xml.push_str(&format!("<Contents><Key>{key}</Key></Contents>"));
        }
        for prefix in prefixes {
            xml.push_str(&format!(
                "<CommonPrefixes><Prefix>{prefix}</Prefix></CommonPrefixes>"
            ));
        }
        xml.push_str("</ListBucketResult>");
        xml.into_bytes()
    }

    fn ok(body: Vec<u8>) -> std::result::Result<TransportResponse, cirrus_transport::TransportError>
    {
        Ok(TransportResponse {
            status: 200,
            headers: BTreeMap::new(),
            body,
        })
    }

    #[test]
    fn test_should_list_children_with_stripped_names() {
        let (harness, _watchdog) = test_context_with_handler(Arc::new(|req| {
            assert!(req.url.contains("prefix=dir/"));
            ok(list_page(
                &["dir/", "dir/a.txt", "dir/$s3fuse$_internal"],
                &["dir/sub/"],
            ))
        }));

        let object = Object::new_directory(Arc::clone(&harness.context), "dir");
        let cache = ObjectCache::new(Arc::clone(&harness.context));

        let mut seen = Vec::new();
        Directory::read(&object, &cache, &mut |name| seen.push(name.to_owned()))
            .expect("read");

        assert_eq!(seen, vec!["sub", "a.txt"]);
    }

    #[test]
    fn test_should_memoize_names_when_configured() {
        let calls = Arc::new(Mutex::new(0usize));
        let calls_clone = Arc::clone(&calls);

        let (harness, _watchdog) = crate::fs::tests_support::test_context_with_handler_and_config(
            Arc::new(move |req| {
                if req.url.contains("prefix=") {
                    *calls_clone.lock() += 1;
                }
                ok(list_page(&["dir/", "dir/x"], &[]))
            }),
            |config| {
                config.cache_directories = true;
                config.precache_on_readdir = false;
            },
        );

        let object = Object::new_directory(Arc::clone(&harness.context), "dir");
        let cache = ObjectCache::new(Arc::clone(&harness.context));

        let mut first = Vec::new();
        Directory::read(&object, &cache, &mut |name| first.push(name.to_owned()))
            .expect("read");
        let mut second = Vec::new();
        Directory::read(&object, &cache, &mut |name| second.push(name.to_owned()))
            .expect("read");

        assert_eq!(first, second);
        let listing_calls = *calls.lock();
        assert_eq!(listing_calls, 1);
    }

    #[test]
    fn test_should_report_empty_directory() {
        let (harness, _watchdog) = test_context_with_handler(Arc::new(|req| {
            assert!(req.url.contains("max-keys=2"));
            ok(list_page(&["dir/"], &[]))
        }));

        let object = Object::new_directory(Arc::clone(&harness.context), "dir");
        assert!(Directory::is_empty(&object));
    }

    #[test]
    fn test_should_report_non_empty_directory() {
        let (harness, _watchdog) = test_context_with_handler(Arc::new(|_req| {
            ok(list_page(&["dir/", "dir/child"], &[]))
        }));

        let object = Object::new_directory(Arc::clone(&harness.context), "dir");
        assert!(!Directory::is_empty(&object));
    }

    #[test]
    fn test_should_never_report_root_empty() {
        let (harness, _watchdog) = test_context_with_handler(Arc::new(|_req| {
            ok(list_page(&[], &[]))
        }));

        let object = Object::new_directory(Arc::clone(&harness.context), "");
        assert!(!Directory::is_empty(&object));
    }

    #[test]
    fn test_should_copy_all_before_deleting_any() {
        use cirrus_transport::HttpMethod;

        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);

        let (harness, _watchdog) = test_context_with_handler(Arc::new(move |req| {
            if req.url.contains("prefix=") {
                return ok(list_page(&["src/", "src/a", "src/sub/", "src/sub/x"], &[]));
            }
            match req.method {
                HttpMethod::Put => {
                    log_clone.lock().push(format!("copy {}", req.url));
                    ok(Vec::new())
                }
                HttpMethod::Delete => {
                    log_clone.lock().push(format!("delete {}", req.url));
                    Ok(TransportResponse {
                        status: 204,
                        headers: BTreeMap::new(),
                        body: Vec::new(),
                    })
                }
                _ => ok(Vec::new()),
            }
        }));

        let cache = ObjectCache::new(Arc::clone(&harness.context));
        Directory::rename(&harness.context, &cache, "src", "dst").expect("rename");

        let log = log.lock();
        let first_delete = log.iter().position(|l| l.starts_with("delete"));
        let last_copy = log.iter().rposition(|l| l.starts_with("copy"));
        assert_eq!(log.iter().filter(|l| l.starts_with("copy")).count(), 4);
        assert_eq!(log.iter().filter(|l| l.starts_with("delete")).count(), 4);
        assert!(last_copy.expect("copies") < first_delete.expect("deletes"));
    }

    #[test]
    fn test_should_keep_sources_when_a_copy_fails() {
        use cirrus_transport::HttpMethod;

        let deletes = Arc::new(Mutex::new(0usize));
        let deletes_clone = Arc::clone(&deletes);

        let (harness, _watchdog) = test_context_with_handler(Arc::new(move |req| {
            if req.url.contains("prefix=") {
                return ok(list_page(&["src/", "src/a"], &[]));
            }
            match req.method {
                HttpMethod::Put => Ok(TransportResponse {
                    status: 403,
                    headers: BTreeMap::new(),
                    body: Vec::new(),
                }),
                HttpMethod::Delete => {
                    *deletes_clone.lock() += 1;
                    ok(Vec::new())
                }
                _ => ok(Vec::new()),
            }
        }));

        let cache = ObjectCache::new(Arc::clone(&harness.context));
        assert!(Directory::rename(&harness.context, &cache, "src", "dst").is_err());
        let delete_count = *deletes.lock();
        assert_eq!(delete_count, 0);
    }

    #[test]
    fn test_should_refuse_renaming_root() {
        let (harness, _watchdog) = test_context_with_handler(Arc::new(|_req| ok(Vec::new())));
        let cache = ObjectCache::new(Arc::clone(&harness.context));
        assert!(Directory::rename(&harness.context, &cache, "", "dst").is_err());
    }

    #[test]
    fn test_should_list_internal_objects() {
        let (harness, _watchdog) = test_context_with_handler(Arc::new(|req| {
            assert!(req.url.contains("prefix=%24s3fuse%24_"));
            ok(list_page(
                &["$s3fuse$_encryption_vk_default", "$s3fuse$_encryption_vk_backup"],
                &[],
            ))
        }));

        let names = Directory::get_internal_objects(&harness.context).expect("list");
        assert_eq!(
            names,
            vec!["encryption_vk_default", "encryption_vk_backup"]
        );
    }
}
