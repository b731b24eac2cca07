//! Completion handles for posted work.
//!
//! The callback-handle/wait-handle pair of the worker pool: a wait handle
//! is a oneshot the caller blocks on; a callback handle runs a closure on
//! the worker thread that completed the item.

use std::sync::Arc;

use cirrus_core::{Error, Result};
use parking_lot::{Condvar, Mutex};

/// A oneshot completion slot callers block on.
///
/// Results cross threads in errno form, so a completed handle can be
/// waited on (and re-read) any number of times.
#[derive(Debug, Default)]
pub struct WaitHandle {
    state: Mutex<Option<i32>>,
    condition: Condvar,
}

impl WaitHandle {
    /// Create an incomplete handle.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Complete the handle with `result`.
    pub fn complete(&self, result: &Result<()>) {
        let errno = match result {
            Ok(()) => 0,
            Err(e) => e.to_errno(),
        };

        let mut state = self.state.lock();
        *state = Some(errno);
        self.condition.notify_all();
    }

    /// Block until completion.
    ///
    /// # Errors
    ///
    /// Returns the error the work item completed with.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.is_none() {
            self.condition.wait(&mut state);
        }

        match state.expect("checked above") {
            0 => Ok(()),
            errno => Err(Error::from_errno(errno)),
        }
    }
}

/// How a completed work item reports its result.
pub enum AsyncHandle {
    /// Complete a [`WaitHandle`] a caller blocks on.
    Wait(Arc<WaitHandle>),
    /// Invoke a closure on the worker thread.
    Callback(Box<dyn FnOnce(Result<()>) + Send>),
    /// Discard the result (`call_async`).
    Discard,
}

impl std::fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wait(_) => f.write_str("AsyncHandle::Wait"),
            Self::Callback(_) => f.write_str("AsyncHandle::Callback"),
            Self::Discard => f.write_str("AsyncHandle::Discard"),
        }
    }
}

impl AsyncHandle {
    /// Deliver `result`.
    pub fn complete(self, result: Result<()>) {
        match self {
            Self::Wait(handle) => handle.complete(&result),
            Self::Callback(callback) => callback(result),
            Self::Discard => {}
        }
    }
}
