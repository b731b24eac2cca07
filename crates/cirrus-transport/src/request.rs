//! The reusable HTTP request object.
//!
//! One `Request` lives on each worker thread for the thread's lifetime and
//! is re-initialized per use. `run` layers two loops: an outer hook loop
//! (sign, execute, ask the hook about a retry) and an inner transport loop
//! (mandatory retry of connection-level failures, HTTP 500/503, and the
//! HTTP 400 `RequestTimeout` server response).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cirrus_core::{Error, Result};
use tracing::{debug, warn};

use crate::transport::{CancelState, TransportError, TransportFactory, TransportRequest};
use crate::{RequestHook, Watchdog, status};

/// HTTP verbs the engine issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET.
    Get,
    /// PUT.
    Put,
    /// POST.
    Post,
    /// DELETE.
    Delete,
    /// HEAD.
    Head,
}

impl HttpMethod {
    /// The verb as it appears in a signing string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }
}

/// Shared construction context for requests: the transport factory, the
/// provider hook, the watchdog, and retry/timeout parameters.
pub struct RequestContext {
    /// Builds one transport per request.
    pub transport_factory: Box<TransportFactory>,
    /// Provider hook, if any.
    pub hook: Option<Arc<dyn RequestHook>>,
    /// Watchdog that enforces deadlines.
    pub watchdog: Arc<Watchdog>,
    /// Inner-loop retry cap.
    pub max_transfer_retries: u32,
    /// Default deadline for `run(None)`.
    pub default_timeout: Duration,
    /// Log every request at debug level.
    pub verbose: bool,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("max_transfer_retries", &self.max_transfer_retries)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

// Body sniff for the server-side timeout that comes back as HTTP 400.
const REQUEST_TIMEOUT_ERROR: &[u8] =
    b"<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>RequestTimeout</Code>";

/// A reusable HTTP request.
pub struct Request {
    context: Arc<RequestContext>,
    transport: Box<dyn crate::HttpTransport>,
    cancel: Arc<CancelState>,

    method: HttpMethod,
    url: String,
    full_url: String,
    headers: BTreeMap<String, String>,
    input: Bytes,

    response_code: u16,
    response_headers: BTreeMap<String, String>,
    output: Vec<u8>,

    run_count: u64,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("response_code", &self.response_code)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Create a request bound to `context`, registering it with the
    /// watchdog.
    #[must_use]
    pub fn new(context: Arc<RequestContext>) -> Self {
        let transport = (context.transport_factory)();
        let cancel = Arc::new(CancelState::default());
        context.watchdog.register(&cancel);

        Self {
            context,
            transport,
            cancel,
            method: HttpMethod::Get,
            url: String::new(),
            full_url: String::new(),
            headers: BTreeMap::new(),
            input: Bytes::new(),
            response_code: 0,
            response_headers: BTreeMap::new(),
            output: Vec::new(),
            run_count: 0,
        }
    }

    /// Reset mutable state for a new use.
    ///
    /// # Panics
    ///
    /// Panics if the request was cancelled by the watchdog; a cancelled
    /// request must be discarded.
    pub fn init(&mut self, method: HttpMethod) {
        assert!(
            !self.cancel.is_cancelled(),
            "cannot reuse a cancelled request"
        );

        self.method = method;
        self.url.clear();
        self.full_url.clear();
        self.headers.clear();
        self.input = Bytes::new();
        self.response_code = 0;
        self.response_headers.clear();
        self.output.clear();
    }

    /// Whether the watchdog cancelled this request.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Set a bucket-relative URL (rewritten through the hook) plus an
    /// optional query string.
    pub fn set_url(&mut self, url: &str, query: &str) {
        let adjusted = self
            .context
            .hook
            .as_ref()
            .map_or_else(|| url.to_owned(), |hook| hook.adjust_url(url));

        self.url = url.to_owned();
        self.full_url = if query.is_empty() {
            adjusted
        } else {
            let sep = if adjusted.contains('?') { '&' } else { '?' };
            format!("{adjusted}{sep}{query}")
        };
    }

    /// Set an already fully qualified URL (bypasses the hook).
    pub fn set_full_url(&mut self, url: &str) {
        self.url = url.to_owned();
        self.full_url = url.to_owned();
    }

    /// The bucket-relative URL of this request.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The HTTP verb of this request.
    #[must_use]
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// Set (or, with an empty value, drop) a request header.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if value.is_empty() {
            self.headers.remove(name);
        } else {
            self.headers.insert(name.to_owned(), value.to_owned());
        }
    }

    /// The current request headers in sorted order.
    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// A request header value, if set.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Set the request body.
    pub fn set_input_buffer(&mut self, input: Bytes) {
        self.input = input;
    }

    /// The response status of the last run.
    #[must_use]
    pub fn response_code(&self) -> u16 {
        self.response_code
    }

    /// A response header (case-insensitive), or `""` when absent.
    #[must_use]
    pub fn response_header(&self, name: &str) -> &str {
        self.response_headers
            .get(&name.to_ascii_lowercase())
            .map_or("", String::as_str)
    }

    /// All response headers (keys lowercased).
    #[must_use]
    pub fn response_headers(&self) -> &BTreeMap<String, String> {
        &self.response_headers
    }

    /// The response body of the last run.
    #[must_use]
    pub fn output_buffer(&self) -> &[u8] {
        &self.output
    }

    /// The response body as UTF-8 (lossy).
    #[must_use]
    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    /// The `Last-Modified` response header as a unix timestamp, if present
    /// and parseable.
    #[must_use]
    pub fn last_modified(&self) -> Option<i64> {
        chrono::DateTime::parse_from_rfc2822(self.response_header("last-modified"))
            .ok()
            .map(|t| t.timestamp())
    }

    /// Execute with retries. `timeout` of `None` uses the context default.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the watchdog cancelled the request,
    /// [`Error::Transport`] when the transport's retries were exhausted,
    /// and whatever the hook's `pre_run` returned on signing failure.
    pub fn run(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::State("cannot reuse a cancelled request"));
        }
        if self.full_url.is_empty() {
            return Err(Error::State("call set_url() first"));
        }

        let timeout = timeout.unwrap_or(self.context.default_timeout);
        let hook = self.context.hook.clone();
        let mut iter = 0u32;

        loop {
            self.set_header("Date", &cirrus_core::http_date());

            if let Some(hook) = &hook {
                hook.pre_run(self, iter)?;
            }

            self.internal_run(timeout)?;

            match &hook {
                Some(hook) if hook.should_retry(self, iter) => iter += 1,
                _ => return Ok(()),
            }
        }
    }

    fn internal_run(&mut self, timeout: Duration) -> Result<()> {
        let mut last_error = String::new();

        for _ in 0..self.context.max_transfer_retries.max(1) {
            self.output.clear();
            self.response_headers.clear();

            let transport_request = TransportRequest {
                method: self.method,
                url: &self.full_url,
                headers: &self.headers,
                body: &self.input,
                timeout,
            };

            self.cancel.set_deadline(Some(Instant::now() + timeout));
            let result = self.transport.execute(&transport_request, &self.cancel);
            self.cancel.set_deadline(None);

            self.run_count += 1;

            if self.context.verbose {
                debug!(
                    method = self.method.as_str(),
                    url = %self.full_url,
                    run = self.run_count,
                    result = ?result.as_ref().map(|r| r.status),
                    "request attempt"
                );
            }

            match result {
                Err(TransportError::Cancelled) => {
                    warn!(url = %self.full_url, "request timed out");
                    return Err(Error::Timeout);
                }
                Err(TransportError::Retryable(e)) => {
                    warn!(url = %self.full_url, error = %e, "transport error, retrying");
                    last_error = e;
                }
                Err(TransportError::Fatal(e)) => {
                    warn!(url = %self.full_url, error = %e, "transport error");
                    return Err(Error::Transport(e));
                }
                Ok(response) => {
                    let retryable_status = response.status == status::INTERNAL_SERVER_ERROR
                        || response.status == status::SERVICE_UNAVAILABLE
                        || (response.status == status::BAD_REQUEST
                            && response.body.starts_with(REQUEST_TIMEOUT_ERROR));

                    self.response_code = response.status;
                    self.response_headers = response.headers;
                    self.output = response.body;

                    if retryable_status {
                        warn!(
                            url = %self.full_url,
                            status = response.status,
                            "server busy, retrying"
                        );
                        last_error = format!("HTTP {}", response.status);
                        continue;
                    }

                    if self.response_code >= 300 && self.response_code != status::NOT_FOUND {
                        warn!(
                            url = %self.full_url,
                            status = self.response_code,
                            response = %self.output_string(),
                            "request failed"
                        );
                    }

                    return Ok(());
                }
            }
        }

        // Out of retries; if the last attempt stored a retryable HTTP
        // status, let the caller map it. Otherwise the transport never
        // produced a response.
        if self.response_code != 0 {
            return Ok(());
        }

        Err(Error::Transport(last_error))
    }
}
