//! Provider adapters for the cirrus engine.
//!
//! A [`StorageService`] describes one provider: its header prefixes, the
//! bucket URL, listing capabilities, the [`cirrus_transport::RequestHook`]
//! that signs requests, and which multipart strategy its uploads use. The
//! [`FileTransfer`] facade picks single-part or multipart strategies by
//! size and drives transfer parts through the parallel work queue.

mod aws;
mod fvs;
mod gs;
mod service;
mod transfer;
mod versioning;
pub mod xml;

pub use aws::AwsService;
pub use fvs::FvsService;
pub use gs::{GsService, TokenExchange};
pub use service::{MultipartCapability, StorageService, create_service};
pub use transfer::{FileTransfer, ReadChunkFn, TransferConfig, WriteChunkFn};
pub use versioning::{ObjectVersion, ObjectVersioning, VersionList};
