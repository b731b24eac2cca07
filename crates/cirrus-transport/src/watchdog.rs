//! Deadline enforcement for in-flight requests.
//!
//! The watchdog keeps weak references to every request's cancel state and
//! ticks on a fixed cadence. A state whose armed deadline has passed is
//! cancelled; the owning transport notices at its next poll and aborts,
//! which surfaces as a timeout to the caller. Dropped requests fall out of
//! the registry on the next sweep.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::transport::CancelState;

/// Background deadline monitor.
#[derive(Debug)]
pub struct Watchdog {
    inner: Arc<Inner>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

#[derive(Debug, Default)]
struct Inner {
    states: Mutex<Vec<Weak<CancelState>>>,
    stop: std::sync::atomic::AtomicBool,
}

impl Inner {
    fn sweep(&self, now: Instant) -> usize {
        let mut states = self.states.lock();
        let mut cancelled = 0;

        states.retain(|weak| match weak.upgrade() {
            Some(state) => {
                if state.check_deadline(now) {
                    cancelled += 1;
                }
                true
            }
            None => false,
        });

        cancelled
    }
}

impl Watchdog {
    /// Start the monitor thread with the given tick interval.
    #[must_use]
    pub fn start(interval: Duration) -> Arc<Self> {
        let inner = Arc::new(Inner::default());
        let thread_inner = Arc::clone(&inner);

        let thread = std::thread::Builder::new()
            .name("cirrus-watchdog".to_owned())
            .spawn(move || {
                while !thread_inner.stop.load(std::sync::atomic::Ordering::SeqCst) {
                    let cancelled = thread_inner.sweep(Instant::now());
                    if cancelled > 0 {
                        debug!(cancelled, "watchdog cancelled requests");
                    }
                    std::thread::sleep(interval);
                }
            })
            .expect("failed to spawn watchdog thread");

        Arc::new(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Track a request's cancel state.
    pub fn register(&self, state: &Arc<CancelState>) {
        self.inner.states.lock().push(Arc::downgrade(state));
    }

    /// Run one sweep immediately; returns how many requests were
    /// cancelled. Exposed for deterministic tests.
    pub fn tick(&self) -> usize {
        self.inner.sweep(Instant::now())
    }

    /// Stop the monitor thread.
    pub fn terminate(&self) {
        self.inner
            .stop
            .store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.inner
            .stop
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_cancel_expired_state() {
        let watchdog = Watchdog::start(Duration::from_secs(3600));
        let state = Arc::new(CancelState::default());
        watchdog.register(&state);

        state.set_deadline(Some(Instant::now() - Duration::from_secs(1)));
        assert_eq!(watchdog.tick(), 1);
        assert!(state.is_cancelled());

        watchdog.terminate();
    }

    #[test]
    fn test_should_leave_unexpired_state_alone() {
        let watchdog = Watchdog::start(Duration::from_secs(3600));
        let state = Arc::new(CancelState::default());
        watchdog.register(&state);

        state.set_deadline(Some(Instant::now() + Duration::from_secs(3600)));
        assert_eq!(watchdog.tick(), 0);
        assert!(!state.is_cancelled());

        watchdog.terminate();
    }

    #[test]
    fn test_should_drop_dead_registrations() {
        let watchdog = Watchdog::start(Duration::from_secs(3600));
        {
            let state = Arc::new(CancelState::default());
            watchdog.register(&state);
        }
        assert_eq!(watchdog.tick(), 0);
        watchdog.terminate();
    }

    #[test]
    fn test_should_cancel_in_background() {
        let watchdog = Watchdog::start(Duration::from_millis(10));
        let state = Arc::new(CancelState::default());
        watchdog.register(&state);

        state.set_deadline(Some(Instant::now() + Duration::from_millis(30)));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !state.is_cancelled() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        assert!(state.is_cancelled());
        watchdog.terminate();
    }
}
