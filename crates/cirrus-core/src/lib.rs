//! Core types shared across the cirrus filesystem engine.
//!
//! This crate provides the foundational building blocks used by every other
//! cirrus crate: the configuration surface, the single error type (and its
//! one-time translation to negative errno at the filesystem boundary),
//! lightweight statistics counters, and small time/path/URL utilities.

mod config;
mod error;
mod stats;
mod util;

pub use config::{Config, ServiceKind};
pub use error::{Error, Result};
pub use stats::{Counter, Statistics};
pub use util::{
    base_name, http_date, is_valid_quoted_md5_etag, parent_path, url_encode,
};
