//! Fixed-size worker pools keyed by priority.
//!
//! Each worker owns one [`Request`] for its lifetime and pulls work items
//! from its pool's FIFO. A work item whose function reports a timeout is
//! re-posted on the same pool while its retry budget lasts. A worker whose
//! request was cancelled by the watchdog discards it and builds a fresh
//! one, so a hung connection never costs a worker.

use std::collections::VecDeque;
use std::sync::Arc;

use cirrus_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::handle::{AsyncHandle, WaitHandle};
use crate::request::{Request, RequestContext};

/// Which pool a work item runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// General background work (transfer orchestration).
    Pr0,
    /// Foreground metadata requests.
    PrReq0,
    /// Transfer parts.
    PrReq1,
}

/// A work function run on a pool worker with the worker's request.
pub type WorkFn = Box<dyn FnMut(&mut Request) -> Result<()> + Send>;

/// Pool sizing and retry parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers in the general pool.
    pub pr0_size: usize,
    /// Workers in the foreground request pool.
    pub pr_req0_size: usize,
    /// Workers in the transfer-part pool.
    pub pr_req1_size: usize,
    /// Default re-post budget for timed-out items.
    pub default_timeout_retries: u32,
    /// Retry cap handed to each request's inner loop.
    pub max_transfer_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pr0_size: 8,
            pr_req0_size: 8,
            pr_req1_size: 4,
            default_timeout_retries: 2,
            max_transfer_retries: 5,
        }
    }
}

struct WorkItem {
    func: WorkFn,
    handle: AsyncHandle,
    timeout_retries: u32,
}

#[derive(Default)]
struct Queue {
    items: Mutex<(VecDeque<WorkItem>, bool)>,
    available: Condvar,
}

impl Queue {
    fn push(&self, item: WorkItem) {
        let mut guard = self.items.lock();
        guard.0.push_back(item);
        self.available.notify_one();
    }

    fn pop(&self) -> Option<WorkItem> {
        let mut guard = self.items.lock();
        loop {
            if let Some(item) = guard.0.pop_front() {
                return Some(item);
            }
            if guard.1 {
                return None;
            }
            self.available.wait(&mut guard);
        }
    }

    fn close(&self) {
        let mut guard = self.items.lock();
        guard.1 = true;
        self.available.notify_all();
    }
}

/// The three worker pools.
pub struct Pool {
    queues: [Arc<Queue>; 3],
    config: PoolConfig,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Spawn all workers.
    #[must_use]
    pub fn start(config: PoolConfig, request_context: Arc<RequestContext>) -> Arc<Self> {
        let queues = [
            Arc::new(Queue::default()),
            Arc::new(Queue::default()),
            Arc::new(Queue::default()),
        ];

        let mut threads = Vec::new();
        let sizes = [config.pr0_size, config.pr_req0_size, config.pr_req1_size];

        for (pool_index, &size) in sizes.iter().enumerate() {
            for worker_index in 0..size {
                let queue = Arc::clone(&queues[pool_index]);
                let context = Arc::clone(&request_context);

                let thread = std::thread::Builder::new()
                    .name(format!("cirrus-pool-{pool_index}-{worker_index}"))
                    .spawn(move || worker(&queue, &context))
                    .expect("failed to spawn pool worker");

                threads.push(thread);
            }
        }

        Arc::new(Self {
            queues,
            config,
            threads: Mutex::new(threads),
        })
    }

    fn queue(&self, priority: Priority) -> &Queue {
        match priority {
            Priority::Pr0 => &self.queues[0],
            Priority::PrReq0 => &self.queues[1],
            Priority::PrReq1 => &self.queues[2],
        }
    }

    /// Enqueue `func` and return a handle to wait on.
    pub fn post(&self, priority: Priority, func: WorkFn) -> Arc<WaitHandle> {
        self.post_with_retries(priority, func, self.config.default_timeout_retries)
    }

    /// Enqueue `func` with an explicit timeout re-post budget.
    pub fn post_with_retries(
        &self,
        priority: Priority,
        func: WorkFn,
        timeout_retries: u32,
    ) -> Arc<WaitHandle> {
        let handle = WaitHandle::new();
        self.queue(priority).push(WorkItem {
            func,
            handle: AsyncHandle::Wait(Arc::clone(&handle)),
            timeout_retries,
        });
        handle
    }

    /// Enqueue `func`, delivering the result to `callback` on the worker.
    pub fn post_callback(
        &self,
        priority: Priority,
        func: WorkFn,
        callback: Box<dyn FnOnce(Result<()>) + Send>,
    ) {
        self.queue(priority).push(WorkItem {
            func,
            handle: AsyncHandle::Callback(callback),
            timeout_retries: self.config.default_timeout_retries,
        });
    }

    /// Enqueue `func` and block for its result.
    ///
    /// # Errors
    ///
    /// Returns whatever the work function returned.
    pub fn call(&self, priority: Priority, func: WorkFn) -> Result<()> {
        self.post(priority, func).wait()
    }

    /// Enqueue `func` and discard the result.
    pub fn call_async(&self, priority: Priority, func: WorkFn) {
        self.queue(priority).push(WorkItem {
            func,
            handle: AsyncHandle::Discard,
            timeout_retries: self.config.default_timeout_retries,
        });
    }

    /// Close all queues and join the workers. Posted items drain first.
    pub fn terminate(&self) {
        for queue in &self.queues {
            queue.close();
        }
        let mut threads = self.threads.lock();
        for thread in threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker(queue: &Arc<Queue>, context: &Arc<RequestContext>) {
    let mut request = Request::new(Arc::clone(context));

    while let Some(item) = queue.pop() {
        let WorkItem {
            mut func,
            handle,
            timeout_retries,
        } = item;

        let result = func(&mut request);

        // A cancelled request is dead; replace it so the worker survives
        // the hung connection.
        if request.is_cancelled() {
            debug!("replacing cancelled worker request");
            request = Request::new(Arc::clone(context));
        }

        match result {
            Err(Error::Timeout) if timeout_retries > 0 => {
                warn!("work item timed out, re-posting");
                queue.push(WorkItem {
                    func,
                    handle,
                    timeout_retries: timeout_retries - 1,
                });
            }
            result => {
                // Release the function (and everything it captured)
                // before waking the caller, so completion is also a
                // resource-release point.
                drop(func);
                handle.complete(result);
            }
        }
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{MockTransport, Script};
    use crate::{HttpMethod, Watchdog};

    fn test_pool(script: Script, config: PoolConfig) -> Arc<Pool> {
        let context = Arc::new(RequestContext {
            transport_factory: MockTransport::factory(script),
            hook: None,
            watchdog: Watchdog::start(Duration::from_millis(20)),
            max_transfer_retries: config.max_transfer_retries,
            default_timeout: Duration::from_millis(200),
            verbose: false,
        });
        Pool::start(config, context)
    }

    #[test]
    fn test_should_run_posted_work() {
        let script = Script::new();
        script.push_response(200, &[], b"body");

        let pool = test_pool(script, PoolConfig::default());

        let result = pool.call(
            Priority::PrReq0,
            Box::new(|request| {
                request.init(HttpMethod::Get);
                request.set_full_url("http://mock/a");
                request.run(None)
            }),
        );

        assert!(result.is_ok());
        pool.terminate();
    }

    #[test]
    fn test_should_invoke_callback_on_completion() {
        let script = Script::new();
        let pool = test_pool(script, PoolConfig::default());

        let done = WaitHandle::new();
        let done_clone = Arc::clone(&done);

        pool.post_callback(
            Priority::Pr0,
            Box::new(|_| Ok(())),
            Box::new(move |result| done_clone.complete(&result)),
        );

        assert!(done.wait().is_ok());
        pool.terminate();
    }

    #[test]
    fn test_should_repost_timed_out_items() {
        let script = Script::new();
        script.push_hang();
        script.push_response(200, &[], b"recovered");

        let config = PoolConfig {
            default_timeout_retries: 2,
            ..PoolConfig::default()
        };
        let pool = test_pool(script, config);

        let result = pool.call(
            Priority::PrReq1,
            Box::new(|request| {
                request.init(HttpMethod::Get);
                request.set_full_url("http://mock/slow-then-ok");
                request.run(Some(Duration::from_millis(100)))
            }),
        );

        assert!(result.is_ok());
        pool.terminate();
    }

    #[test]
    fn test_should_surface_timeout_when_budget_exhausted() {
        let script = Script::new();
        for _ in 0..8 {
            script.push_hang();
        }

        let config = PoolConfig {
            default_timeout_retries: 1,
            ..PoolConfig::default()
        };
        let pool = test_pool(script, config);

        let result = pool.call(
            Priority::PrReq1,
            Box::new(|request| {
                request.init(HttpMethod::Get);
                request.set_full_url("http://mock/always-slow");
                request.run(Some(Duration::from_millis(80)))
            }),
        );

        assert_eq!(
            result.expect_err("must time out").to_errno(),
            -libc::ETIMEDOUT
        );
        pool.terminate();
    }

    #[test]
    fn test_should_run_items_in_parallel() {
        let script = Script::new();
        let pool = test_pool(script, PoolConfig::default());

        let barrier = Arc::new(std::sync::Barrier::new(4));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            handles.push(pool.post(
                Priority::PrReq0,
                Box::new(move |_| {
                    // Deadlocks unless four workers run concurrently.
                    barrier.wait();
                    Ok(())
                }),
            ));
        }

        for handle in handles {
            assert!(handle.wait().is_ok());
        }
        pool.terminate();
    }
}
