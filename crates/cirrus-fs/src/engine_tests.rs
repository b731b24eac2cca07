//! End-to-end engine scenarios against an in-memory bucket.
//!
//! The mock speaks just enough of the wire protocol to exercise the
//! whole engine: HEAD/GET/PUT/DELETE, ranged GETs, listings with
//! delimiter/marker/max-keys, server-side COPY with `if-match`, and
//! AWS-style multipart uploads.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use cirrus_core::Config;
use cirrus_crypto::{Md5, SecretBuffer, Sha256HashList};
use cirrus_services::AwsService;
use cirrus_transport::mock::{CapturedRequest, MockTransport};
use cirrus_transport::{HttpMethod, TransportError, TransportResponse};
use parking_lot::Mutex;

use crate::encryption::Encryption;
use crate::file::OpenMode;
use crate::fs::{Filesystem, FilesystemBuilder};
use crate::metadata;

const ENDPOINT: &str = "https://s3.amazonaws.com/test-bucket";

#[derive(Debug, Clone, Default)]
struct StoredObject {
    body: Vec<u8>,
    content_type: String,
    meta: BTreeMap<String, String>,
    etag: String,
}

#[derive(Default)]
struct MockBucket {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, BTreeMap<u32, Vec<u8>>>>,
    next_upload_id: AtomicU32,
    fail_puts: AtomicBool,
    put_count: AtomicU32,
}

fn query_value<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix(&format!("{name}=")))
}

fn response(status: u16, headers: BTreeMap<String, String>, body: Vec<u8>) -> TransportResponse {
    TransportResponse {
        status,
        headers,
        body,
    }
}

fn percent_decode(s: &str) -> String {
    percent_encoding::percent_decode_str(s)
        .decode_utf8_lossy()
        .into_owned()
}

impl MockBucket {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn object_headers(object: &StoredObject) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_owned(), object.content_type.clone());
        headers.insert("content-length".to_owned(), object.body.len().to_string());
        headers.insert("etag".to_owned(), object.etag.clone());
        for (name, value) in &object.meta {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }

    fn meta_from_request(request: &CapturedRequest) -> (String, BTreeMap<String, String>) {
        let content_type = request
            .headers
            .get("Content-Type")
            .cloned()
            .unwrap_or_else(|| "binary/octet-stream".to_owned());

        let meta = request
            .headers
            .iter()
            .filter(|(name, _)| name.to_ascii_lowercase().starts_with("x-amz-meta-"))
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();

        (content_type, meta)
    }

    fn list(&self, query: &str) -> TransportResponse {
        let prefix = percent_decode(query_value(query, "prefix").unwrap_or(""));
        let marker = percent_decode(query_value(query, "marker").unwrap_or(""));
        let delimiter = query_value(query, "delimiter").is_some();
        let max_keys: usize = query_value(query, "max-keys")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);

        let objects = self.objects.lock();
        let mut keys = Vec::new();
        let mut prefixes = Vec::new();
        let mut truncated = false;

        for key in objects.keys() {
            if !key.starts_with(&prefix) || key.as_str() <= marker.as_str() {
                continue;
            }

            if keys.len() + prefixes.len() >= max_keys {
                truncated = true;
                break;
            }

            let relative = &key[prefix.len()..];
            if delimiter {
                if let Some(pos) = relative.find('/') {
                    let common = format!("{prefix}{}", &relative[..=pos]);
                    if prefixes.last() != Some(&common) {
                        prefixes.push(common);
                    }
                    continue;
                }
            }
            keys.push(key.clone());
        }

        let mut xml = format!(
            "<ListBucketResult><IsTruncated>{truncated}</IsTruncated>"
        );
        for key in &keys {
            xml.push_str(&format!("<Contents><Key>{key}</Key></Contents>"));
        }
        for common in &prefixes {
            xml.push_str(&format!(
                "<CommonPrefixes><Prefix>{common}</Prefix></CommonPrefixes>"
            ));
        }
        xml.push_str("</ListBucketResult>");

        response(200, BTreeMap::new(), xml.into_bytes())
    }

    fn copy(
        &self,
        request: &CapturedRequest,
        destination: &str,
    ) -> TransportResponse {
        let source_header = request
            .headers
            .iter()
            .find(|(name, _)| name.ends_with("copy-source"))
            .map(|(_, value)| value.clone())
            .expect("copy-source header");
        let source_key = percent_decode(
            source_header
                .strip_prefix("/test-bucket/")
                .unwrap_or(&source_header),
        );

        let if_match = request
            .headers
            .iter()
            .find(|(name, _)| name.ends_with("copy-source-if-match"))
            .map(|(_, value)| value.clone());

        let replace = request
            .headers
            .iter()
            .any(|(name, value)| name.ends_with("metadata-directive") && value == "REPLACE");

        let mut objects = self.objects.lock();
        let Some(source) = objects.get(&source_key).cloned() else {
            return response(404, BTreeMap::new(), Vec::new());
        };

        if let Some(expected) = if_match {
            if expected != source.etag {
                return response(412, BTreeMap::new(), Vec::new());
            }
        }

        let (content_type, meta) = if replace {
            Self::meta_from_request(request)
        } else {
            (source.content_type.clone(), source.meta.clone())
        };

        // A copy reproduces the content MD5 as the new ETag, like S3.
        let etag = Md5::hex_quoted(&source.body);
        let stored = StoredObject {
            body: source.body,
            content_type,
            meta,
            etag: etag.clone(),
        };
        objects.insert(destination.to_owned(), stored);

        let body = format!("<CopyObjectResult><ETag>{etag}</ETag></CopyObjectResult>");
        let mut headers = BTreeMap::new();
        headers.insert("etag".to_owned(), etag);
        response(200, headers, body.into_bytes())
    }

    fn handle(&self, request: &CapturedRequest) -> Result<TransportResponse, TransportError> {
        let rest = request
            .url
            .strip_prefix(ENDPOINT)
            .unwrap_or_else(|| panic!("unexpected url {}", request.url));
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let key = percent_decode(path.strip_prefix('/').unwrap_or(path));

        match request.method {
            HttpMethod::Head => {
                let objects = self.objects.lock();
                match objects.get(&key) {
                    Some(object) => Ok(response(200, Self::object_headers(object), Vec::new())),
                    None => Ok(response(404, BTreeMap::new(), Vec::new())),
                }
            }

            HttpMethod::Get if query.contains("prefix=") => Ok(self.list(query)),

            HttpMethod::Get => {
                let objects = self.objects.lock();
                let Some(object) = objects.get(&key) else {
                    return Ok(response(404, BTreeMap::new(), Vec::new()));
                };

                if let Some(range) = request.headers.get("Range") {
                    let range = range.strip_prefix("bytes=").expect("bytes range");
                    let (start, end) = range.split_once('-').expect("range form");
                    let start: usize = start.parse().expect("start");
                    let end: usize = end.parse().expect("end");
                    let end = end.min(object.body.len().saturating_sub(1));
                    return Ok(response(
                        206,
                        Self::object_headers(object),
                        object.body[start..=end].to_vec(),
                    ));
                }

                Ok(response(
                    200,
                    Self::object_headers(object),
                    object.body.clone(),
                ))
            }

            HttpMethod::Post if query == "uploads" => {
                let id = format!("upload-{}", self.next_upload_id.fetch_add(1, Ordering::SeqCst));
                self.uploads.lock().insert(id.clone(), BTreeMap::new());
                Ok(response(
                    200,
                    BTreeMap::new(),
                    format!(
                        "<InitiateMultipartUploadResult><UploadId>{id}</UploadId></InitiateMultipartUploadResult>"
                    )
                    .into_bytes(),
                ))
            }

            HttpMethod::Post => {
                let upload_id = query_value(query, "uploadId").expect("uploadId").to_owned();
                let parts = self
                    .uploads
                    .lock()
                    .remove(&upload_id)
                    .expect("known upload");

                let mut body = Vec::new();
                let mut digests = Vec::new();
                for part in parts.values() {
                    digests.extend_from_slice(&Md5::digest(part));
                    body.extend_from_slice(part);
                }
                let etag = format!("\"{}-{}\"", Md5::hex(&digests), parts.len());

                self.objects.lock().insert(
                    key,
                    StoredObject {
                        body,
                        content_type: "binary/octet-stream".to_owned(),
                        meta: BTreeMap::new(),
                        etag: etag.clone(),
                    },
                );

                Ok(response(
                    200,
                    BTreeMap::new(),
                    format!(
                        "<CompleteMultipartUploadResult><ETag>{etag}</ETag></CompleteMultipartUploadResult>"
                    )
                    .into_bytes(),
                ))
            }

            HttpMethod::Put if request.headers.keys().any(|h| h.ends_with("copy-source")) => {
                Ok(self.copy(request, &key))
            }

            HttpMethod::Put if query.contains("partNumber=") => {
                let number: u32 = query_value(query, "partNumber")
                    .and_then(|v| v.parse().ok())
                    .expect("part number");
                let upload_id = query_value(query, "uploadId").expect("uploadId");

                let etag = Md5::hex_quoted(&request.body);
                self.uploads
                    .lock()
                    .get_mut(upload_id)
                    .expect("known upload")
                    .insert(number, request.body.clone());

                let mut headers = BTreeMap::new();
                headers.insert("etag".to_owned(), etag);
                Ok(response(200, headers, Vec::new()))
            }

            HttpMethod::Put => {
                if self.fail_puts.load(Ordering::SeqCst) {
                    // Simulates a stalled transport the watchdog killed.
                    return Err(TransportError::Cancelled);
                }

                self.put_count.fetch_add(1, Ordering::SeqCst);
                let (content_type, meta) = Self::meta_from_request(request);
                let etag = Md5::hex_quoted(&request.body);

                self.objects.lock().insert(
                    key,
                    StoredObject {
                        body: request.body.clone(),
                        content_type,
                        meta,
                        etag: etag.clone(),
                    },
                );

                let mut headers = BTreeMap::new();
                headers.insert("etag".to_owned(), etag);
                Ok(response(200, headers, Vec::new()))
            }

            HttpMethod::Delete => {
                let removed = self.objects.lock().remove(&key).is_some();
                Ok(response(
                    if removed { 204 } else { 404 },
                    BTreeMap::new(),
                    Vec::new(),
                ))
            }
        }
    }

    fn stored(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().get(key).cloned()
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }
}

fn test_filesystem(
    bucket: &Arc<MockBucket>,
    tweak: impl FnOnce(&mut Config),
) -> (Arc<Filesystem>, tempfile::TempDir) {
    let store_dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config {
        bucket_name: "test-bucket".to_owned(),
        local_store_path: store_dir.path().to_string_lossy().into_owned(),
        cache_expiry_seconds: 3600,
        precache_on_readdir: false,
        max_transfer_retries: 2,
        ..Config::default()
    };
    tweak(&mut config);

    let service = Arc::new(AwsService::with_credentials(
        &config,
        "test-key".to_owned(),
        "test-secret".to_owned(),
    ));

    let handler_bucket = Arc::clone(bucket);
    let factory = MockTransport::handler_factory(Arc::new(move |request: &CapturedRequest| {
        handler_bucket.handle(request)
    }));

    let fs = FilesystemBuilder::new(config)
        .service(service)
        .transport_factory(Arc::from(factory))
        .build()
        .expect("filesystem");

    (fs, store_dir)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_should_create_write_read_release() {
    let bucket = MockBucket::new();
    let (fs, _dir) = test_filesystem(&bucket, |_| {});

    let handle = fs
        .create_and_open("a.txt", 0o644, 1000, 1000)
        .expect("create");
    assert_eq!(fs.write(handle, b"hello", 0).expect("write"), 5);
    fs.flush(handle).expect("flush");
    fs.release(handle).expect("release");

    let stored = bucket.stored("a.txt").expect("uploaded");
    assert_eq!(stored.body, b"hello");
    assert_eq!(
        stored.meta.get("x-amz-meta-s3fuse-mode").map(String::as_str),
        Some("0644")
    );

    let handle = fs.open("a.txt", OpenMode::Default).expect("open");
    let mut buf = [0u8; 5];
    assert_eq!(fs.read(handle, &mut buf, 0).expect("read"), 5);
    assert_eq!(&buf, b"hello");
    fs.release(handle).expect("release");

    assert_eq!(fs.get_stats("a.txt").expect("stat").size, 5);
    fs.terminate();
}

#[test]
fn test_should_hash_verify_multipart_upload() {
    let bucket = MockBucket::new();
    let (fs, _dir) = test_filesystem(&bucket, |config| {
        config.download_chunk_size = 5 * 1024 * 1024;
    });

    let data = pattern(12 * 1024 * 1024);

    let handle = fs
        .create_and_open("big.bin", 0o644, 0, 0)
        .expect("create");
    assert_eq!(
        fs.write(handle, &data, 0).expect("write"),
        data.len()
    );
    fs.flush(handle).expect("flush");
    fs.release(handle).expect("release");

    // Three parts, a multipart-style etag, and the chunked root recorded
    // in metadata.
    let stored = bucket.stored("big.bin").expect("uploaded");
    assert_eq!(stored.body, data);
    assert!(stored.etag.ends_with("-3\""));

    let expected_root = {
        let list = Sha256HashList::new(data.len() as u64);
        list.compute_hash(0, &data).expect("hash");
        list.root_hash_hex()
    };
    assert_eq!(
        stored.meta.get("x-amz-meta-s3fuse-sha256").map(String::as_str),
        Some(expected_root.as_str())
    );

    // Re-open: ranged download re-verifies the root.
    fs.cache().remove("big.bin");
    let handle = fs.open("big.bin", OpenMode::Default).expect("open");
    let mut buf = vec![0u8; data.len()];
    assert_eq!(
        fs.read(handle, &mut buf, 0).expect("read"),
        data.len()
    );
    assert_eq!(buf, data);
    fs.release(handle).expect("release");
    fs.terminate();
}

#[test]
fn test_should_round_trip_encrypted_file() {
    let bucket = MockBucket::new();
    let volume_key = SecretBuffer::generate(32);
    let encryption = Encryption::with_volume_key(volume_key);

    let store_dir = tempfile::tempdir().expect("tempdir");
    let config = Config {
        bucket_name: "test-bucket".to_owned(),
        local_store_path: store_dir.path().to_string_lossy().into_owned(),
        cache_expiry_seconds: 3600,
        precache_on_readdir: false,
        use_encryption: true,
        volume_key_id: "default".to_owned(),
        ..Config::default()
    };
    let service = Arc::new(AwsService::with_credentials(
        &config,
        "k".to_owned(),
        "s".to_owned(),
    ));
    let handler_bucket = Arc::clone(&bucket);
    let factory = MockTransport::handler_factory(Arc::new(move |request: &CapturedRequest| {
        handler_bucket.handle(request)
    }));

    let fs = FilesystemBuilder::new(config)
        .service(service)
        .transport_factory(Arc::from(factory))
        .encryption(encryption)
        .build()
        .expect("filesystem");

    let data = pattern(1024 * 1024);

    let handle = fs.create_and_open("secret.bin", 0o600, 0, 0).expect("create");
    assert_eq!(fs.write(handle, &data, 0).expect("write"), data.len());
    fs.flush(handle).expect("flush");
    fs.release(handle).expect("release");

    // At rest: ciphertext, the encrypted content type, and an envelope.
    let stored = bucket.stored("secret.bin").expect("uploaded");
    assert_eq!(stored.body.len(), data.len());
    assert_ne!(stored.body, data);
    assert_eq!(stored.content_type, metadata::ENCRYPTED_CONTENT_TYPE);
    assert!(stored.meta.contains_key("x-amz-meta-s3fuse-enc-iv"));
    assert!(stored.meta.contains_key("x-amz-meta-s3fuse-enc-meta"));
    // The plaintext hash travels only inside the envelope.
    assert!(!stored.meta.contains_key("x-amz-meta-s3fuse-sha256"));

    // Evict and re-open: envelope unlock, download, decrypt, verify.
    fs.cache().remove("secret.bin");
    let handle = fs.open("secret.bin", OpenMode::Default).expect("open");
    let mut buf = vec![0u8; data.len()];
    assert_eq!(fs.read(handle, &mut buf, 0).expect("read"), data.len());
    assert_eq!(buf, data);
    fs.release(handle).expect("release");
    fs.terminate();
}

#[test]
fn test_should_rename_directory_subtree() {
    let bucket = MockBucket::new();
    let (fs, _dir) = test_filesystem(&bucket, |_| {});

    fs.create_directory("src", 0o755, 0, 0).expect("mkdir");
    fs.create_directory("src/sub", 0o755, 0, 0).expect("mkdir");
    for path in ["src/a", "src/b", "src/c", "src/d", "src/sub/x"] {
        fs.create_file(path, 0o644, 0, 0).expect("create");
    }

    fs.rename("src", "dst").expect("rename");

    let mut names = Vec::new();
    fs.read_directory("dst", &mut |name| names.push(name.to_owned()))
        .expect("readdir");
    names.sort();
    assert_eq!(names, vec!["a", "b", "c", "d", "sub"]);

    let mut nested = Vec::new();
    fs.read_directory("dst/sub", &mut |name| nested.push(name.to_owned()))
        .expect("readdir");
    assert_eq!(nested, vec!["x"]);

    assert!(bucket.keys_with_prefix("src").is_empty());
    assert!(fs.get_stats("src").is_err());
    fs.terminate();
}

#[test]
fn test_should_latch_timeout_from_cancelled_upload() {
    let bucket = MockBucket::new();
    let (fs, _dir) = test_filesystem(&bucket, |_| {});

    let handle = fs.create_and_open("t.txt", 0o644, 0, 0).expect("create");
    assert_eq!(fs.write(handle, b"data", 0).expect("write"), 4);

    bucket.fail_puts.store(true, Ordering::SeqCst);

    let flush_error = fs.flush(handle).expect_err("must time out");
    assert_eq!(flush_error.to_errno(), -libc::ETIMEDOUT);

    // The error is latched: subsequent reads report it too.
    let mut buf = [0u8; 4];
    let read_error = fs.read(handle, &mut buf, 0).expect_err("latched");
    assert_eq!(read_error.to_errno(), -libc::ETIMEDOUT);

    bucket.fail_puts.store(false, Ordering::SeqCst);
    fs.release(handle).expect("release");
    fs.terminate();
}

// ---------------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------------

#[test]
fn test_should_fail_truncating_open_of_missing_path() {
    let bucket = MockBucket::new();
    let (fs, _dir) = test_filesystem(&bucket, |_| {});

    let error = fs
        .open("missing.txt", OpenMode::Truncate)
        .expect_err("must fail");
    assert_eq!(error.to_errno(), -libc::ENOENT);
    fs.terminate();
}

#[test]
fn test_should_reject_mismatched_rename_types() {
    let bucket = MockBucket::new();
    let (fs, _dir) = test_filesystem(&bucket, |_| {});

    fs.create_directory("dir", 0o755, 0, 0).expect("mkdir");
    fs.create_directory("dir2", 0o755, 0, 0).expect("mkdir");
    fs.create_file("dir2/child", 0o644, 0, 0).expect("create");
    fs.create_file("file", 0o644, 0, 0).expect("create");

    // A file onto an existing directory, a directory onto a file, and a
    // directory onto a non-empty directory.
    assert_eq!(
        fs.rename("file", "dir").expect_err("EISDIR").to_errno(),
        -libc::EISDIR
    );
    assert_eq!(
        fs.rename("dir", "file").expect_err("ENOTDIR").to_errno(),
        -libc::ENOTDIR
    );
    assert_eq!(
        fs.rename("dir", "dir2").expect_err("ENOTEMPTY").to_errno(),
        -libc::ENOTEMPTY
    );
    fs.terminate();
}

#[test]
fn test_should_mark_same_size_truncate_dirty() {
    let bucket = MockBucket::new();
    let (fs, _dir) = test_filesystem(&bucket, |_| {});

    let handle = fs.create_and_open("f", 0o644, 0, 0).expect("create");
    fs.write(handle, b"12345", 0).expect("write");
    fs.flush(handle).expect("flush");

    let puts_before = bucket.put_count.load(Ordering::SeqCst);

    // Truncating to the current size still dirties the file.
    fs.ftruncate(handle, 5).expect("truncate");
    fs.flush(handle).expect("flush");
    assert!(bucket.put_count.load(Ordering::SeqCst) > puts_before);

    fs.release(handle).expect("release");
    fs.terminate();
}

#[test]
fn test_should_overwrite_file_via_rename() {
    let bucket = MockBucket::new();
    let (fs, _dir) = test_filesystem(&bucket, |_| {});

    let handle = fs.create_and_open("from", 0o644, 0, 0).expect("create");
    fs.write(handle, b"payload", 0).expect("write");
    fs.flush(handle).expect("flush");
    fs.release(handle).expect("release");

    fs.create_file("to", 0o644, 0, 0).expect("create");
    fs.rename("from", "to").expect("rename");

    assert!(bucket.stored("from").is_none());
    assert_eq!(bucket.stored("to").expect("present").body, b"payload");
    fs.terminate();
}

#[test]
fn test_should_round_trip_xattrs() {
    let bucket = MockBucket::new();
    let (fs, _dir) = test_filesystem(&bucket, |_| {});

    fs.create_file("f", 0o644, 0, 0).expect("create");

    fs.set_xattr("f", "user.color", b"mauve", 0).expect("set");

    let mut buf = [0u8; 16];
    let n = fs
        .get_xattr("f", "user.color", Some(&mut buf))
        .expect("get");
    assert_eq!(&buf[..n], b"mauve");

    // The attribute survives eviction because it rode a commit.
    fs.cache().remove("f");
    let n = fs
        .get_xattr("f", "user.color", Some(&mut buf))
        .expect("get after refetch");
    assert_eq!(&buf[..n], b"mauve");

    let names = fs.list_xattrs("f").expect("list");
    assert!(names.contains(&"user.color".to_owned()));
    assert!(names.contains(&"user.__etag__".to_owned()));

    fs.remove_xattr("f", "user.color").expect("remove");
    assert_eq!(
        fs.get_xattr("f", "user.color", None)
            .expect_err("gone")
            .to_errno(),
        -libc::ENODATA
    );

    // Reserved keys cannot be set through the public API.
    assert!(fs.set_xattr("f", "user.s3fuse-mode", b"x", 0).is_err());
    fs.terminate();
}

#[test]
fn test_should_serve_symlinks() {
    let bucket = MockBucket::new();
    let (fs, _dir) = test_filesystem(&bucket, |_| {});

    fs.create_symlink("link", 0, 0, "target/file").expect("symlink");

    let stored = bucket.stored("link").expect("present");
    assert_eq!(stored.body, b"target/file");
    assert_eq!(stored.content_type, metadata::SYMLINK_CONTENT_TYPE);

    // Evict so the read goes through HEAD + type checker + GET.
    fs.cache().remove("link");
    assert_eq!(fs.read_symlink("link").expect("readlink"), "target/file");
    assert_eq!(
        fs.get_stats("link").expect("stat").mode & libc::S_IFMT,
        libc::S_IFLNK
    );
    fs.terminate();
}

#[test]
fn test_should_enforce_directory_removal_rules() {
    let bucket = MockBucket::new();
    let (fs, _dir) = test_filesystem(&bucket, |_| {});

    fs.create_directory("d", 0o755, 0, 0).expect("mkdir");
    fs.create_file("d/child", 0o644, 0, 0).expect("create");

    assert_eq!(
        fs.remove_directory("d").expect_err("ENOTEMPTY").to_errno(),
        -libc::ENOTEMPTY
    );
    assert_eq!(
        fs.remove_file("d").expect_err("EISDIR").to_errno(),
        -libc::EISDIR
    );

    fs.remove_file("d/child").expect("unlink");
    fs.remove_directory("d").expect("rmdir");
    assert!(bucket.stored("d/").is_none());
    fs.terminate();
}

#[test]
fn test_should_answer_root_getattr_via_bridge() {
    let bucket = MockBucket::new();
    let (fs, _dir) = test_filesystem(&bucket, |_| {});
    let bridge = crate::bridge::FuseBridge::new(Arc::clone(&fs), 0o750);

    let mut stat = crate::object::Stat::default();
    assert_eq!(bridge.getattr("/", &mut stat), 0);
    assert_eq!(stat.mode, libc::S_IFDIR | 0o750);
    // SAFETY: geteuid cannot fail.
    assert_eq!(stat.uid, unsafe { libc::geteuid() });

    // Invalid shapes are rejected before touching the engine.
    assert_eq!(bridge.getattr("relative", &mut stat), -libc::EINVAL);
    assert_eq!(bridge.getattr("/trailing/", &mut stat), -libc::EINVAL);
    fs.terminate();
}
