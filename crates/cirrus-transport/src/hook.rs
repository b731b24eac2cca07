//! Provider hook into the request pipeline.

use cirrus_core::Result;

use crate::Request;

/// Per-provider request shaping: URL rewriting, signing, and retry policy.
///
/// `pre_run` is invoked before every attempt of the outer retry loop with
/// the attempt index; `should_retry` decides after the attempt whether the
/// pipeline goes around again (GCS uses this to retry exactly once after
/// refreshing an expired OAuth token).
pub trait RequestHook: Send + Sync {
    /// Turn a bucket-relative URL into a fully qualified one.
    fn adjust_url(&self, url: &str) -> String;

    /// Sign (and otherwise decorate) the request for attempt `iter`.
    ///
    /// # Errors
    ///
    /// A signing failure aborts the request.
    fn pre_run(&self, request: &mut Request, iter: u32) -> Result<()>;

    /// Whether the completed attempt `iter` should be retried.
    fn should_retry(&self, request: &Request, iter: u32) -> bool;
}
