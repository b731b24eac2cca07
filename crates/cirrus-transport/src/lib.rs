//! HTTP request pipeline and thread infrastructure for cirrus.
//!
//! The pieces fit together like this: fixed-size worker [`pool`]s keyed by
//! a priority own one reusable [`Request`] per worker; a request executes
//! through an opaque [`transport`] with a retry loop and provider
//! [`hook`]s for URL shaping, signing, and auth-failure retry; a
//! [`watchdog`] thread cancels requests whose deadline elapsed; the
//! [`work_queue`] fans transfer parts out over a pool with bounded
//! parallelism and per-part retry.

mod handle;
mod hook;
#[cfg(feature = "mock")]
pub mod mock;
mod pool;
mod request;
mod transport;
mod watchdog;
mod work_queue;

pub use handle::{AsyncHandle, WaitHandle};
pub use hook::RequestHook;
pub use pool::{Pool, PoolConfig, Priority, WorkFn};
pub use request::{HttpMethod, Request, RequestContext};
pub use transport::{
    CancelState, HttpTransport, ReqwestTransport, TransportError, TransportRequest,
    TransportResponse, TransportFactory,
};
pub use watchdog::Watchdog;
pub use work_queue::ParallelWorkQueue;

/// HTTP status codes the engine branches on.
pub mod status {
    /// 200 OK.
    pub const OK: u16 = 200;
    /// 201 Created.
    pub const CREATED: u16 = 201;
    /// 204 No Content.
    pub const NO_CONTENT: u16 = 204;
    /// 206 Partial Content.
    pub const PARTIAL_CONTENT: u16 = 206;
    /// 308 Resume Incomplete (GCS resumable uploads).
    pub const RESUME: u16 = 308;
    /// 400 Bad Request.
    pub const BAD_REQUEST: u16 = 400;
    /// 401 Unauthorized.
    pub const UNAUTHORIZED: u16 = 401;
    /// 403 Forbidden.
    pub const FORBIDDEN: u16 = 403;
    /// 404 Not Found.
    pub const NOT_FOUND: u16 = 404;
    /// 500 Internal Server Error.
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    /// 503 Service Unavailable.
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}
