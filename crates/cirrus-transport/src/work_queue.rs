//! Bounded-parallel, retryable fan-out over transfer parts.
//!
//! Used by multipart upload/download and bulk rename. At most
//! `max_parts_in_progress` parts are in flight; completions are collected
//! in posting order; a part failing with a retryable code is re-posted up
//! to the cap; any other failure stops new postings (in-flight parts are
//! drained) and becomes the queue's result.

use std::collections::VecDeque;
use std::sync::Arc;

use cirrus_core::{Error, Result};
use tracing::debug;

use crate::handle::WaitHandle;
use crate::pool::{Pool, Priority};
use crate::request::Request;

/// A per-part work function; invoked with the worker's request, the part,
/// and whether this invocation is a retry.
pub type PartFn<T> = dyn Fn(&mut Request, &T, bool) -> Result<()> + Send + Sync;

/// Bounded-concurrency work queue over an ordered sequence of parts.
pub struct ParallelWorkQueue<T> {
    parts: Vec<Arc<T>>,
    process: Arc<PartFn<T>>,
    max_retries: u32,
    max_in_progress: usize,
}

impl<T> std::fmt::Debug for ParallelWorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelWorkQueue")
            .field("parts", &self.parts.len())
            .field("max_retries", &self.max_retries)
            .field("max_in_progress", &self.max_in_progress)
            .finish_non_exhaustive()
    }
}

struct InFlight {
    index: usize,
    retry_count: u32,
    handle: Arc<WaitHandle>,
}

impl<T: Send + Sync + 'static> ParallelWorkQueue<T> {
    /// Build a queue over `parts`.
    #[must_use]
    pub fn new(
        parts: Vec<T>,
        process: Arc<PartFn<T>>,
        max_retries: u32,
        max_in_progress: usize,
    ) -> Self {
        Self {
            parts: parts.into_iter().map(Arc::new).collect(),
            process,
            max_retries,
            max_in_progress: max_in_progress.max(1),
        }
    }

    fn post(&self, pool: &Pool, index: usize, retry_count: u32, is_retry: bool) -> InFlight {
        let part = Arc::clone(&self.parts[index]);
        let process = Arc::clone(&self.process);

        InFlight {
            index,
            retry_count,
            // Timeout re-posting is handled here, not by the pool.
            handle: pool.post_with_retries(
                Priority::PrReq1,
                Box::new(move |request| process(request, &part, is_retry)),
                0,
            ),
        }
    }

    /// Run all parts to completion.
    ///
    /// # Errors
    ///
    /// The first fatal part error, or the first retryable error whose
    /// retries were exhausted.
    pub fn process(&self, pool: &Pool) -> Result<()> {
        let mut in_progress: VecDeque<InFlight> = VecDeque::new();
        let mut next_part = 0usize;
        let mut result: Result<()> = Ok(());

        while next_part < self.parts.len() && in_progress.len() < self.max_in_progress {
            in_progress.push_back(self.post(pool, next_part, 0, false));
            next_part += 1;
        }

        while let Some(flight) = in_progress.pop_front() {
            let part_result = flight.handle.wait();

            if let Err(error) = part_result {
                debug!(part = flight.index, %error, "part failed");

                if error.is_retryable_part() && flight.retry_count < self.max_retries {
                    in_progress.push_back(self.post(
                        pool,
                        flight.index,
                        flight.retry_count + 1,
                        true,
                    ));
                } else if result.is_ok() {
                    // Only the first non-successful code is kept.
                    result = Err(error);
                }
            }

            // Keep collecting until nothing is pending; once a part has
            // failed for good, stop posting new parts.
            if result.is_ok() && next_part < self.parts.len() {
                in_progress.push_back(self.post(pool, next_part, 0, false));
                next_part += 1;
            }
        }

        result
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::mock::{MockTransport, Script};
    use crate::pool::PoolConfig;
    use crate::request::RequestContext;
    use crate::Watchdog;

    fn test_pool() -> Arc<Pool> {
        let context = Arc::new(RequestContext {
            transport_factory: MockTransport::factory(Script::new()),
            hook: None,
            watchdog: Watchdog::start(Duration::from_millis(20)),
            max_transfer_retries: 3,
            default_timeout: Duration::from_millis(200),
            verbose: false,
        });
        Pool::start(PoolConfig::default(), context)
    }

    #[test]
    fn test_should_process_all_parts() {
        let pool = test_pool();
        let processed = Arc::new(Mutex::new(Vec::new()));
        let processed_clone = Arc::clone(&processed);

        let queue = ParallelWorkQueue::new(
            (0..10).collect::<Vec<u32>>(),
            Arc::new(move |_request, part: &u32, _is_retry| {
                processed_clone.lock().push(*part);
                Ok(())
            }),
            3,
            4,
        );

        assert!(queue.process(&pool).is_ok());

        let mut seen = processed.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<u32>>());
        pool.terminate();
    }

    #[test]
    fn test_should_retry_retryable_parts() {
        let pool = test_pool();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let queue = ParallelWorkQueue::new(
            vec![1u32],
            Arc::new(move |_request, _part, is_retry| {
                let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
                assert_eq!(is_retry, n > 0);
                if n < 2 {
                    Err(Error::ServerBusy)
                } else {
                    Ok(())
                }
            }),
            3,
            4,
        );

        assert!(queue.process(&pool).is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        pool.terminate();
    }

    #[test]
    fn test_should_give_up_after_retry_cap() {
        let pool = test_pool();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let queue = ParallelWorkQueue::new(
            vec![1u32],
            Arc::new(move |_request, _part, _is_retry| {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                Err(Error::ServerBusy)
            }),
            2,
            4,
        );

        let error = queue.process(&pool).expect_err("must fail");
        assert_eq!(error.to_errno(), -libc::EAGAIN);
        // Initial attempt plus two retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        pool.terminate();
    }

    #[test]
    fn test_should_stop_posting_after_fatal_error() {
        let pool = test_pool();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let queue = ParallelWorkQueue::new(
            (0..100).collect::<Vec<u32>>(),
            Arc::new(move |_request, part: &u32, _is_retry| {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                if *part == 0 {
                    Err(Error::NotFound)
                } else {
                    Ok(())
                }
            }),
            3,
            2,
        );

        let error = queue.process(&pool).expect_err("must fail");
        assert_eq!(error.to_errno(), -libc::ENOENT);
        // Far fewer than 100 parts ran: the fatal error halts posting.
        assert!(attempts.load(Ordering::SeqCst) < 10);
        pool.terminate();
    }

    #[test]
    fn test_should_handle_empty_part_list() {
        let pool = test_pool();
        let queue: ParallelWorkQueue<u32> =
            ParallelWorkQueue::new(Vec::new(), Arc::new(|_, _, _| Ok(())), 3, 4);
        assert!(queue.process(&pool).is_ok());
        pool.terminate();
    }
}
