//! The opaque HTTP transport behind the request pipeline.
//!
//! The engine never talks to an HTTP client directly; it hands a
//! [`TransportRequest`] to an [`HttpTransport`] together with the request's
//! [`CancelState`]. A transport streams bodies in small blocks and polls
//! the cancel state between blocks, so a watchdog cancellation aborts an
//! in-flight call promptly.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::HttpMethod;

/// Shared cancellation and deadline state of one request.
///
/// The watchdog holds a weak reference; cancellation is observable exactly
/// once through [`CancelState::cancel`].
#[derive(Debug, Default)]
pub struct CancelState {
    deadline: Mutex<Option<Instant>>,
    cancelled: AtomicBool,
}

impl CancelState {
    /// Arm (or disarm, with `None`) the deadline the watchdog enforces.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock() = deadline;
    }

    /// Whether this request has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel the request. Returns `true` only for the caller that
    /// performed the transition.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    /// Cancel if the armed deadline has passed. Returns `true` when this
    /// call performed the cancellation.
    pub fn check_deadline(&self, now: Instant) -> bool {
        let expired = self.deadline.lock().is_some_and(|d| now > d);
        if expired { self.cancel() } else { false }
    }
}

/// A fully shaped request ready for the wire.
#[derive(Debug)]
pub struct TransportRequest<'a> {
    /// HTTP verb.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: &'a str,
    /// Headers in canonical (sorted) order.
    pub headers: &'a BTreeMap<String, String>,
    /// Request body (empty for bodyless verbs).
    pub body: &'a Bytes,
    /// Coarse transport-level timeout (the watchdog enforces the real
    /// deadline).
    pub timeout: Duration,
}

/// A decoded response.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, keys lowercased.
    pub headers: BTreeMap<String, String>,
    /// Response body.
    pub body: Vec<u8>,
}

/// How a transport call failed.
#[derive(Debug)]
pub enum TransportError {
    /// A failure the retry loop must retry: DNS, connect, TLS, partial
    /// transfer, send/recv, premature EOF, bad content encoding.
    Retryable(String),
    /// The watchdog cancelled the request mid-flight.
    Cancelled,
    /// A failure retrying cannot fix (malformed URL, ...).
    Fatal(String),
}

/// Opaque blocking HTTP transport.
pub trait HttpTransport: Send {
    /// Execute one request, polling `cancel` while streaming.
    ///
    /// # Errors
    ///
    /// See [`TransportError`].
    fn execute(
        &mut self,
        request: &TransportRequest<'_>,
        cancel: &Arc<CancelState>,
    ) -> Result<TransportResponse, TransportError>;
}

/// Creates one transport per worker thread.
pub type TransportFactory = dyn Fn() -> Box<dyn HttpTransport> + Send + Sync;

/// Production transport over a blocking `reqwest` client.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport").finish_non_exhaustive()
    }
}

impl ReqwestTransport {
    /// Build a transport with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Fatal`] when the TLS backend cannot be
    /// initialized.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(None)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Fatal(e.to_string()))?;

        Ok(Self { client })
    }

    fn map_error(e: &reqwest::Error) -> TransportError {
        // Connection-level failures are always worth retrying; anything
        // carrying a status was already a response and is handled by the
        // caller.
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
            TransportError::Retryable(e.to_string())
        } else {
            TransportError::Fatal(e.to_string())
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(
        &mut self,
        request: &TransportRequest<'_>,
        cancel: &Arc<CancelState>,
    ) -> Result<TransportResponse, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        };

        let mut builder = self
            .client
            .request(method, request.url)
            .timeout(request.timeout);

        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }

        if !request.body.is_empty() || matches!(request.method, HttpMethod::Put | HttpMethod::Post)
        {
            let reader = CancelReader {
                inner: std::io::Cursor::new(request.body.clone()),
                cancel: Arc::clone(cancel),
            };
            builder = builder.body(reqwest::blocking::Body::sized(
                reader,
                request.body.len() as u64,
            ));
        }

        let response = self.client.execute(
            builder
                .build()
                .map_err(|e| TransportError::Fatal(e.to_string()))?,
        );

        let mut response = match response {
            Ok(r) => r,
            Err(e) => {
                return Err(if cancel.is_cancelled() {
                    TransportError::Cancelled
                } else {
                    Self::map_error(&e)
                });
            }
        };

        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_owned());
            }
        }

        let mut body = Vec::new();
        let mut block = [0u8; 64 * 1024];
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            match response.read(&mut block) {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&block[..n]),
                Err(e) => {
                    return Err(if cancel.is_cancelled() {
                        TransportError::Cancelled
                    } else {
                        TransportError::Retryable(format!("body read failed: {e}"))
                    });
                }
            }
        }

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

// `reqwest::blocking::Body::sized` wants a `'static` reader; sharing the
// cancel state by `Arc` satisfies the bound.
struct CancelReader {
    inner: std::io::Cursor<Bytes>,
    cancel: Arc<CancelState>,
}

impl Read for CancelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(std::io::Error::other("request cancelled"));
        }
        // Feed the body in bounded blocks so cancellation is checked
        // regularly even for large uploads.
        let cap = buf.len().min(64 * 1024);
        self.inner.read(&mut buf[..cap])
    }
}
