//! File transfer strategies.
//!
//! The facade picks a strategy by size: single-shot GET/PUT below the
//! chunk thresholds, ranged parallel GETs and provider multipart uploads
//! above them. Chunk reads and writes go through caller-supplied
//! callbacks, which is where the engine's hash list taps the stream.
//! Sub-resource queries (`?uploads`, `?partNumber=...`) are embedded in
//! the request URL so they participate in request signing.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cirrus_core::{Config, Error, Result, is_valid_quoted_md5_etag};
use cirrus_crypto::Md5;
use cirrus_transport::{
    HttpMethod, ParallelWorkQueue, Pool, Priority, Request, status,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::MultipartCapability;

/// Receives downloaded bytes at their file offset.
pub type WriteChunkFn = dyn Fn(&[u8], u64) -> Result<()> + Send + Sync;

/// Produces `size` upload bytes from a file offset.
pub type ReadChunkFn = dyn Fn(u64, u64) -> Result<Vec<u8>> + Send + Sync;

/// Transfer sizing and retry parameters.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Threshold and chunk size for ranged downloads.
    pub download_chunk_size: u64,
    /// Threshold and chunk size for multipart uploads.
    pub upload_chunk_size: u64,
    /// Per-part retry cap.
    pub max_transfer_retries: u32,
    /// Maximum parts in flight.
    pub max_parts_in_progress: usize,
    /// Deadline for individual transfer requests.
    pub transfer_timeout: Duration,
}

impl TransferConfig {
    /// Derive from the engine configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            download_chunk_size: config.download_chunk_size,
            upload_chunk_size: config.effective_upload_chunk_size(),
            max_transfer_retries: config.max_transfer_retries,
            max_parts_in_progress: config.max_parts_in_progress,
            transfer_timeout: Duration::from_secs(config.transfer_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PartRange {
    index: usize,
    offset: u64,
    size: u64,
}

fn build_ranges(total: u64, chunk: u64) -> Vec<PartRange> {
    let count = total.div_ceil(chunk);
    (0..count)
        .map(|i| PartRange {
            index: i as usize,
            offset: i * chunk,
            size: if i == count - 1 {
                total - i * chunk
            } else {
                chunk
            },
        })
        .collect()
}

/// Provider-neutral transfer facade.
pub struct FileTransfer {
    pool: Arc<Pool>,
    multipart: MultipartCapability,
    config: TransferConfig,
}

impl std::fmt::Debug for FileTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransfer")
            .field("multipart", &self.multipart)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FileTransfer {
    /// Build the facade for one provider.
    #[must_use]
    pub fn new(pool: Arc<Pool>, multipart: MultipartCapability, config: TransferConfig) -> Self {
        Self {
            pool,
            multipart,
            config,
        }
    }

    /// The effective download chunk size.
    #[must_use]
    pub fn download_chunk_size(&self) -> u64 {
        self.config.download_chunk_size
    }

    /// The effective upload chunk size.
    #[must_use]
    pub fn upload_chunk_size(&self) -> u64 {
        self.config.upload_chunk_size
    }

    /// Download `size` bytes from `url` into `on_write`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for a missing object, transfer errors
    /// otherwise.
    pub fn download(&self, url: &str, size: u64, on_write: &Arc<WriteChunkFn>) -> Result<()> {
        if self.config.download_chunk_size > 0 && size > self.config.download_chunk_size {
            self.download_multi(url, size, on_write)
        } else {
            self.download_single(url, on_write)
        }
    }

    fn download_single(&self, url: &str, on_write: &Arc<WriteChunkFn>) -> Result<()> {
        let url = url.to_owned();
        let on_write = Arc::clone(on_write);
        let timeout = self.config.transfer_timeout;

        self.pool.call(
            Priority::PrReq1,
            Box::new(move |request| {
                request.init(HttpMethod::Get);
                request.set_url(&url, "");
                request.run(Some(timeout))?;

                match request.response_code() {
                    status::OK => on_write(request.output_buffer(), 0),
                    status::NOT_FOUND => Err(Error::NotFound),
                    code => Err(Error::Http(code)),
                }
            }),
        )
    }

    fn download_multi(&self, url: &str, size: u64, on_write: &Arc<WriteChunkFn>) -> Result<()> {
        let ranges = build_ranges(size, self.config.download_chunk_size);
        let url = url.to_owned();
        let on_write = Arc::clone(on_write);
        let timeout = self.config.transfer_timeout;

        let queue = ParallelWorkQueue::new(
            ranges,
            Arc::new(move |request: &mut Request, part: &PartRange, is_retry: bool| {
                if is_retry {
                    debug!(part = part.index, url = %url, "retrying download part");
                }

                request.init(HttpMethod::Get);
                request.set_url(&url, "");
                request.set_header(
                    "Range",
                    &format!("bytes={}-{}", part.offset, part.offset + part.size - 1),
                );
                request.run(Some(timeout))?;

                match request.response_code() {
                    status::PARTIAL_CONTENT => {
                        let body = request.output_buffer();
                        if (body.len() as u64) < part.size {
                            return Err(Error::Transport(format!(
                                "short range response: {} < {}",
                                body.len(),
                                part.size
                            )));
                        }
                        on_write(&body[..part.size as usize], part.offset)
                    }
                    status::INTERNAL_SERVER_ERROR | status::SERVICE_UNAVAILABLE => {
                        Err(Error::ServerBusy)
                    }
                    code => Err(Error::Http(code)),
                }
            }),
            self.config.max_transfer_retries,
            self.config.max_parts_in_progress,
        );

        queue.process(&self.pool)
    }

    /// Upload `size` bytes read from `on_read` to `url`, returning the
    /// server's ETag.
    ///
    /// # Errors
    ///
    /// [`Error::Integrity`] when the server's ETag contradicts the local
    /// MD5, transfer errors otherwise.
    pub fn upload(&self, url: &str, size: u64, on_read: &Arc<ReadChunkFn>) -> Result<String> {
        if self.config.upload_chunk_size > 0 && size > self.config.upload_chunk_size {
            match self.multipart {
                MultipartCapability::AwsStyle => self.upload_multi_aws(url, size, on_read),
                MultipartCapability::GcsResumable => self.upload_multi_gcs(url, size, on_read),
            }
        } else {
            self.upload_single(url, size, on_read)
        }
    }

    fn upload_single(&self, url: &str, size: u64, on_read: &Arc<ReadChunkFn>) -> Result<String> {
        let url = url.to_owned();
        let on_read = Arc::clone(on_read);
        let timeout = self.config.transfer_timeout;
        let etag_slot: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let etag_out = Arc::clone(&etag_slot);

        self.pool.call(
            Priority::PrReq1,
            Box::new(move |request| {
                let data = on_read(size, 0)?;
                let expected_b64 = Md5::base64(&data);
                let expected_hex = Md5::hex_quoted(&data);

                request.init(HttpMethod::Put);
                request.set_url(&url, "");
                request.set_header("Content-MD5", &expected_b64);
                request.set_input_buffer(Bytes::from(data));
                request.run(Some(timeout))?;

                if request.response_code() != status::OK {
                    warn!(url = %url, code = request.response_code(), "upload failed");
                    return Err(Error::Http(request.response_code()));
                }

                let etag = request.response_header("etag").to_owned();

                if is_valid_quoted_md5_etag(&etag) && etag != expected_hex {
                    warn!(url = %url, %etag, expected = %expected_hex, "etag mismatch");
                    return Err(Error::Integrity {
                        expected: expected_hex,
                        actual: etag,
                    });
                }

                *etag_out.lock() = etag;
                Ok(())
            }),
        )?;

        let etag = etag_slot.lock().clone();
        Ok(etag)
    }

    fn upload_multi_aws(&self, url: &str, size: u64, on_read: &Arc<ReadChunkFn>) -> Result<String> {
        let timeout = self.config.transfer_timeout;

        // Initiate.
        let upload_id = {
            let url = url.to_owned();
            let slot: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
            let out = Arc::clone(&slot);

            self.pool.call(
                Priority::PrReq0,
                Box::new(move |request| {
                    request.init(HttpMethod::Post);
                    request.set_url(&format!("{url}?uploads"), "");
                    request.run(None)?;

                    if request.response_code() != status::OK {
                        return Err(Error::Http(request.response_code()));
                    }

                    *out.lock() = crate::xml::parse_initiate_multipart(request.output_buffer())?;
                    Ok(())
                }),
            )?;

            let id = slot.lock().clone();
            id
        };

        // Parts, collected into a 1-based ETag list.
        let ranges = build_ranges(size, self.config.upload_chunk_size);
        let part_count = ranges.len();
        let etags: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec![String::new(); part_count]));

        let queue = {
            let url = url.to_owned();
            let upload_id = upload_id.clone();
            let on_read = Arc::clone(on_read);
            let etags = Arc::clone(&etags);

            ParallelWorkQueue::new(
                ranges,
                Arc::new(move |request: &mut Request, part: &PartRange, is_retry: bool| {
                    if is_retry {
                        debug!(part = part.index, url = %url, "retrying upload part");
                    }

                    let data = on_read(part.size, part.offset)?;
                    let expected_etag = Md5::hex_quoted(&data);

                    request.init(HttpMethod::Put);
                    // Part numbers are 1-based.
                    request.set_url(
                        &format!("{url}?partNumber={}&uploadId={upload_id}", part.index + 1),
                        "",
                    );
                    request.set_input_buffer(Bytes::from(data));
                    request.run(Some(timeout))?;

                    match request.response_code() {
                        status::OK => {
                            if request.response_header("etag") != expected_etag {
                                warn!(
                                    part = part.index,
                                    etag = request.response_header("etag"),
                                    expected = %expected_etag,
                                    "part etag mismatch, assuming temporary failure"
                                );
                                return Err(Error::ServerBusy);
                            }
                            etags.lock()[part.index] = expected_etag;
                            Ok(())
                        }
                        status::INTERNAL_SERVER_ERROR | status::SERVICE_UNAVAILABLE => {
                            Err(Error::ServerBusy)
                        }
                        code => Err(Error::Http(code)),
                    }
                }),
                self.config.max_transfer_retries,
                self.config.max_parts_in_progress,
            )
        };

        if let Err(error) = queue.process(&self.pool) {
            warn!(url = %url, %error, "one or more parts failed, aborting upload");
            self.abort_multipart(url, &upload_id);
            return Err(error);
        }

        // Complete with the part list in posting order.
        let body = {
            let etags = etags.lock();
            let mut body = String::from("<CompleteMultipartUpload>");
            for (i, etag) in etags.iter().enumerate() {
                body.push_str(&format!(
                    "<Part><PartNumber>{}</PartNumber><ETag>{etag}</ETag></Part>",
                    i + 1
                ));
            }
            body.push_str("</CompleteMultipartUpload>");
            body
        };

        let url_owned = url.to_owned();
        let slot: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let out = Arc::clone(&slot);

        self.pool.call(
            Priority::PrReq0,
            Box::new(move |request| {
                request.init(HttpMethod::Post);
                request.set_url(&format!("{url_owned}?uploadId={upload_id}"), "");
                request.set_input_buffer(Bytes::from(body.clone()));
                // Completion can take a while on large objects.
                request.run(Some(timeout))?;

                if request.response_code() != status::OK {
                    return Err(Error::Http(request.response_code()));
                }

                *out.lock() = crate::xml::parse_complete_multipart(request.output_buffer())?;
                Ok(())
            }),
        )?;

        let etag = slot.lock().clone();
        Ok(etag)
    }

    fn abort_multipart(&self, url: &str, upload_id: &str) {
        let url = url.to_owned();
        let upload_id = upload_id.to_owned();

        let result = self.pool.call(
            Priority::PrReq0,
            Box::new(move |request| {
                request.init(HttpMethod::Delete);
                request.set_url(&format!("{url}?uploadId={upload_id}"), "");
                request.run(None)
            }),
        );

        if let Err(error) = result {
            warn!(%error, "failed to abort multipart upload");
        }
    }

    fn upload_multi_gcs(&self, url: &str, size: u64, on_read: &Arc<ReadChunkFn>) -> Result<String> {
        const UPLOAD_ID_DELIM: &str = "?upload_id=";

        let timeout = self.config.transfer_timeout;

        // Start a resumable session; the session URL keeps the object's
        // path so request signing still sees the same resource.
        let session = {
            let url = url.to_owned();
            let slot: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
            let out = Arc::clone(&slot);

            self.pool.call(
                Priority::PrReq0,
                Box::new(move |request| {
                    request.init(HttpMethod::Post);
                    request.set_url(&url, "");
                    request.set_header("x-goog-resumable", "start");
                    request.run(None)?;

                    if request.response_code() != status::CREATED {
                        return Err(Error::Http(request.response_code()));
                    }

                    let location = request.response_header("location");
                    let pos = location.find(UPLOAD_ID_DELIM).ok_or_else(|| {
                        Error::Invalid("no upload id in resumable location".to_owned())
                    })?;

                    *out.lock() = format!("{url}{}", &location[pos..]);
                    Ok(())
                }),
            )?;

            let session = slot.lock().clone();
            session
        };

        let mut ranges = build_ranges(size, self.config.upload_chunk_size);
        let last = ranges.pop().ok_or(Error::State("empty upload"))?;

        // Middle parts are strictly serialized and answered with 308.
        let queue = {
            let session = session.clone();
            let on_read = Arc::clone(on_read);

            ParallelWorkQueue::new(
                ranges,
                Arc::new(move |request: &mut Request, part: &PartRange, is_retry: bool| {
                    if is_retry {
                        debug!(part = part.index, "retrying resumable part");
                    }

                    put_content_range(request, &session, &on_read, part, None, timeout)?;

                    match request.response_code() {
                        status::RESUME => Ok(()),
                        status::INTERNAL_SERVER_ERROR | status::SERVICE_UNAVAILABLE => {
                            Err(Error::ServerBusy)
                        }
                        code => Err(Error::Http(code)),
                    }
                }),
                self.config.max_transfer_retries,
                1,
            )
        };

        queue.process(&self.pool)?;

        // The last part carries the total size and returns the ETag.
        let on_read = Arc::clone(on_read);
        let slot: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let out = Arc::clone(&slot);

        self.pool.call(
            Priority::PrReq0,
            Box::new(move |request| {
                put_content_range(request, &session, &on_read, &last, Some(size), timeout)?;

                if request.response_code() != status::OK {
                    return Err(Error::Http(request.response_code()));
                }

                *out.lock() = request.response_header("etag").to_owned();
                Ok(())
            }),
        )?;

        let etag = slot.lock().clone();
        Ok(etag)
    }
}

fn put_content_range(
    request: &mut Request,
    session: &str,
    on_read: &Arc<ReadChunkFn>,
    part: &PartRange,
    total: Option<u64>,
    timeout: Duration,
) -> Result<()> {
    let data = on_read(part.size, part.offset)?;

    request.init(HttpMethod::Put);
    request.set_url(session, "");
    request.set_header(
        "Content-Range",
        &format!(
            "bytes {}-{}/{}",
            part.offset,
            part.offset + part.size - 1,
            total.map_or_else(|| "*".to_owned(), |t| t.to_string()),
        ),
    );
    request.set_input_buffer(Bytes::from(data));
    request.run(Some(timeout))
}
