//! Lightweight runtime statistics.
//!
//! Counters are cheap atomic cells registered by name; [`Statistics::dump`]
//! renders a plain-text report, optionally written to the configured stats
//! file at teardown.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A named monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increment by one.
    pub fn incr(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`.
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Registry of named counters.
///
/// Shared across the engine via `Arc`; tests instantiate their own.
#[derive(Debug, Default)]
pub struct Statistics {
    counters: Mutex<BTreeMap<String, Arc<Counter>>>,
}

impl Statistics {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the counter with the given name.
    #[must_use]
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut counters = self.counters.lock();
        counters
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Counter::default()))
            .clone()
    }

    /// Write all counters, sorted by name, to `out`.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn dump(&self, out: &mut impl Write) -> std::io::Result<()> {
        let counters = self.counters.lock();
        for (name, counter) in counters.iter() {
            writeln!(out, "{name}: {}", counter.get())?;
        }
        Ok(())
    }

    /// Write the report to `path`, if non-empty.
    ///
    /// # Errors
    ///
    /// Propagates file creation and write failures.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        if path.is_empty() {
            return Ok(());
        }
        let mut file = std::fs::File::create(path)?;
        self.dump(&mut file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_count_increments() {
        let stats = Statistics::new();
        let c = stats.counter("object_cache.hits");
        c.incr();
        c.incr();
        c.add(3);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn test_should_share_counters_by_name() {
        let stats = Statistics::new();
        stats.counter("x").incr();
        stats.counter("x").incr();
        assert_eq!(stats.counter("x").get(), 2);
    }

    #[test]
    fn test_should_dump_sorted_report() {
        let stats = Statistics::new();
        stats.counter("b.second").add(2);
        stats.counter("a.first").incr();

        let mut buf = Vec::new();
        stats.dump(&mut buf).expect("dump");
        let report = String::from_utf8(buf).expect("utf8");
        assert_eq!(report, "a.first: 1\nb.second: 2\n");
    }

    #[test]
    fn test_should_skip_empty_stats_file() {
        let stats = Statistics::new();
        assert!(stats.write_to_file("").is_ok());
    }
}
