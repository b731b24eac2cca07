//! Error types for the cirrus engine.
//!
//! All layers below the filesystem boundary return [`Error`]. The boundary
//! adapter translates an error exactly once into a negative errno via
//! [`Error::to_errno`]; nothing else in the engine inspects errno values
//! except the latched per-file async error, which round-trips through
//! [`Error::from_errno`].

/// Engine-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The HTTP transport failed in a way that exhausted its retries
    /// (DNS, connect, TLS, partial transfer, send/recv, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The watchdog cancelled the request, or a deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// The server answered with an unexpected HTTP status.
    #[error("unexpected HTTP status {0}")]
    Http(u16),

    /// The server is temporarily unavailable (HTTP 500/503 or a
    /// retryable per-part failure).
    #[error("server busy")]
    ServerBusy,

    /// A response body could not be parsed as the expected XML.
    #[error("XML error: {0}")]
    Xml(String),

    /// A transferred object failed its hash check.
    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity {
        /// The hash recorded in object metadata (or the server ETag).
        expected: String,
        /// The hash computed over the transferred bytes.
        actual: String,
    },

    /// A cryptographic operation failed (bad key, malformed envelope, ...).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// An operation was attempted in a state that forbids it
    /// (non-quiescent release, reuse of a cancelled request, ...).
    #[error("invalid state: {0}")]
    State(&'static str),

    /// A caller-supplied argument is malformed (path shape, xattr key,
    /// reserved prefix, ...).
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// The object does not exist (HTTP 404).
    #[error("object not found")]
    NotFound,

    /// Access was denied (HTTP 401/403, or a locked encrypted file).
    #[error("permission denied")]
    PermissionDenied,

    /// The object already exists.
    #[error("object already exists")]
    Exists,

    /// The requested extended attribute does not exist.
    #[error("no such attribute")]
    NoAttr,

    /// A directory is not empty.
    #[error("directory not empty")]
    NotEmpty,

    /// The target of the operation is a directory.
    #[error("is a directory")]
    IsDir,

    /// The target of the operation is not a directory.
    #[error("not a directory")]
    NotDir,

    /// A local file operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Internal error with context.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Translate into a negative errno for the filesystem boundary.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Transport(_) | Self::Http(_) | Self::Xml(_) | Self::Integrity { .. } => {
                -libc::EIO
            }
            Self::Timeout => -libc::ETIMEDOUT,
            Self::ServerBusy => -libc::EAGAIN,
            Self::Crypto(_) | Self::PermissionDenied => -libc::EACCES,
            Self::State(_) => -libc::EBUSY,
            Self::Invalid(_) => -libc::EINVAL,
            Self::NotFound => -libc::ENOENT,
            Self::Exists => -libc::EEXIST,
            Self::NoAttr => -libc::ENODATA,
            Self::NotEmpty => -libc::ENOTEMPTY,
            Self::IsDir => -libc::EISDIR,
            Self::NotDir => -libc::ENOTDIR,
            Self::Io(e) => e.raw_os_error().map_or(-libc::EIO, |c| -c),
            Self::Internal(_) => -libc::EIO,
        }
    }

    /// Reconstruct an error from a latched errno.
    ///
    /// Used by the open-file engine, which stores the outcome of a
    /// background transfer as a raw code. For every code produced by
    /// [`Error::to_errno`] the round trip preserves the code.
    #[must_use]
    pub fn from_errno(errno: i32) -> Self {
        match errno.abs() {
            libc::ENOENT => Self::NotFound,
            libc::EACCES => Self::PermissionDenied,
            libc::ETIMEDOUT => Self::Timeout,
            libc::EAGAIN => Self::ServerBusy,
            libc::EBUSY => Self::State("busy"),
            libc::EINVAL => Self::Invalid("invalid argument".to_owned()),
            libc::ENODATA => Self::NoAttr,
            libc::ENOTEMPTY => Self::NotEmpty,
            libc::EISDIR => Self::IsDir,
            libc::ENOTDIR => Self::NotDir,
            libc::EEXIST => Self::Exists,
            code => Self::Io(std::io::Error::from_raw_os_error(code)),
        }
    }

    /// Whether a failed transfer part may be re-posted by the parallel
    /// work queue.
    #[must_use]
    pub fn is_retryable_part(&self) -> bool {
        matches!(self, Self::ServerBusy | Self::Timeout)
    }
}

/// Convenience result type for cirrus operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_map_not_found_to_enoent() {
        assert_eq!(Error::NotFound.to_errno(), -libc::ENOENT);
    }

    #[test]
    fn test_should_map_timeout_to_etimedout() {
        assert_eq!(Error::Timeout.to_errno(), -libc::ETIMEDOUT);
    }

    #[test]
    fn test_should_map_integrity_to_eio() {
        let err = Error::Integrity {
            expected: "aa".to_owned(),
            actual: "bb".to_owned(),
        };
        assert_eq!(err.to_errno(), -libc::EIO);
    }

    #[test]
    fn test_should_map_state_to_ebusy() {
        assert_eq!(Error::State("busy").to_errno(), -libc::EBUSY);
    }

    #[test]
    fn test_should_map_crypto_to_eacces() {
        assert_eq!(Error::Crypto("bad key".to_owned()).to_errno(), -libc::EACCES);
    }

    #[test]
    fn test_should_round_trip_latched_errno() {
        for code in [
            -libc::ENOENT,
            -libc::EACCES,
            -libc::ETIMEDOUT,
            -libc::EAGAIN,
            -libc::EBUSY,
            -libc::EINVAL,
            -libc::ENODATA,
            -libc::ENOTEMPTY,
            -libc::EISDIR,
            -libc::ENOTDIR,
            -libc::EEXIST,
            -libc::EIO,
        ] {
            assert_eq!(Error::from_errno(code).to_errno(), code, "code {code}");
        }
    }

    #[test]
    fn test_should_flag_retryable_parts() {
        assert!(Error::ServerBusy.is_retryable_part());
        assert!(Error::Timeout.is_retryable_part());
        assert!(!Error::NotFound.is_retryable_part());
        assert!(!Error::Http(400).is_retryable_part());
    }

    #[test]
    fn test_should_preserve_io_errno() {
        let err = Error::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.to_errno(), -libc::ENOSPC);
    }
}
