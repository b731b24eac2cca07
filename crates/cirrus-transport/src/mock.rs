//! Scripted in-memory transport for tests.
//!
//! Two modes: a FIFO [`Script`] of canned responses (order-sensitive,
//! good for pipeline tests) and a handler function receiving every
//! request (good for engine tests that model a whole bucket). Both
//! capture the requests they served.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::transport::{
    CancelState, HttpTransport, TransportError, TransportFactory, TransportRequest,
    TransportResponse,
};
use crate::HttpMethod;

/// A captured request.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    /// HTTP verb.
    pub method: HttpMethod,
    /// Absolute URL as the transport saw it.
    pub url: String,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Request body.
    pub body: Vec<u8>,
}

enum Step {
    Respond(TransportResponse),
    Error(String),
    Hang,
}

#[derive(Default)]
struct ScriptInner {
    steps: Mutex<std::collections::VecDeque<Step>>,
    captured: Mutex<Vec<CapturedRequest>>,
}

/// A shared FIFO of canned transport outcomes.
#[derive(Clone, Default)]
pub struct Script {
    inner: Arc<ScriptInner>,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script").finish_non_exhaustive()
    }
}

impl Script {
    /// Create an empty script. A request arriving with no step scripted
    /// gets a `200 OK` with an empty body.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a response.
    pub fn push_response(&self, status: u16, headers: &[(&str, &str)], body: &[u8]) {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), (*v).to_owned()))
            .collect();

        self.inner
            .steps
            .lock()
            .push_back(Step::Respond(TransportResponse {
                status,
                headers,
                body: body.to_vec(),
            }));
    }

    /// Script a retryable transport error.
    pub fn push_error(&self, message: &str) {
        self.inner
            .steps
            .lock()
            .push_back(Step::Error(message.to_owned()));
    }

    /// Script a hang: the transport blocks until the watchdog cancels
    /// the request.
    pub fn push_hang(&self) {
        self.inner.steps.lock().push_back(Step::Hang);
    }

    /// How many requests the script has served.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.inner.captured.lock().len()
    }

    /// The most recently served request.
    #[must_use]
    pub fn last_request(&self) -> Option<CapturedRequest> {
        self.inner.captured.lock().last().cloned()
    }

    /// All served requests.
    #[must_use]
    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.inner.captured.lock().clone()
    }
}

/// A handler deciding the outcome of each request.
pub type MockHandler =
    dyn Fn(&CapturedRequest) -> Result<TransportResponse, TransportError> + Send + Sync;

enum Mode {
    Scripted(Script),
    Handler(Arc<MockHandler>),
}

/// Transport implementation driven by a [`Script`] or a handler.
pub struct MockTransport {
    mode: Mode,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport").finish_non_exhaustive()
    }
}

impl MockTransport {
    /// A factory producing transports that share `script`.
    #[must_use]
    pub fn factory(script: Script) -> Box<TransportFactory> {
        Box::new(move || {
            Box::new(Self {
                mode: Mode::Scripted(script.clone()),
            })
        })
    }

    /// A factory producing transports that share `handler`.
    #[must_use]
    pub fn handler_factory(handler: Arc<MockHandler>) -> Box<TransportFactory> {
        Box::new(move || {
            Box::new(Self {
                mode: Mode::Handler(Arc::clone(&handler)),
            })
        })
    }
}

impl HttpTransport for MockTransport {
    fn execute(
        &mut self,
        request: &TransportRequest<'_>,
        cancel: &Arc<CancelState>,
    ) -> Result<TransportResponse, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let captured = CapturedRequest {
            method: request.method,
            url: request.url.to_owned(),
            headers: request.headers.clone(),
            body: request.body.to_vec(),
        };

        match &self.mode {
            Mode::Scripted(script) => {
                script.inner.captured.lock().push(captured);

                let step = script.inner.steps.lock().pop_front();
                match step {
                    None => Ok(TransportResponse {
                        status: 200,
                        headers: BTreeMap::new(),
                        body: Vec::new(),
                    }),
                    Some(Step::Respond(response)) => Ok(response),
                    Some(Step::Error(message)) => Err(TransportError::Retryable(message)),
                    Some(Step::Hang) => {
                        let give_up = Instant::now() + Duration::from_secs(30);
                        while !cancel.is_cancelled() {
                            if Instant::now() > give_up {
                                return Err(TransportError::Retryable(
                                    "mock hang was never cancelled".to_owned(),
                                ));
                            }
                            std::thread::sleep(Duration::from_millis(5));
                        }
                        Err(TransportError::Cancelled)
                    }
                }
            }
            Mode::Handler(handler) => handler(&captured),
        }
    }
}
