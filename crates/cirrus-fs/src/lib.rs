//! The cirrus filesystem engine.
//!
//! Projects an S3-compatible bucket as a POSIX-ish tree: objects become
//! files, `/`-suffixed zero-byte markers become directories, and custom
//! object metadata carries UNIX semantics (mode, owner, mtime, symlink
//! targets) plus extended attributes. The [`Filesystem`] façade owns the
//! explicit context (configuration, provider, worker pools, metadata
//! cache, local store, encryption) and exposes the operation surface the
//! kernel bridge calls through [`FuseBridge`].

mod bridge;
mod cache;
mod directory;
mod encrypted_file;
mod encryption;
#[cfg(test)]
mod engine_tests;
mod file;
mod fs;
mod list_reader;
mod local;
pub mod metadata;
mod object;
mod volume_key;
mod xattr;

pub use bridge::FuseBridge;
pub use cache::{CacheHint, ObjectCache};
pub use directory::{Directory, DirNode};
pub use encryption::Encryption;
pub use file::{FileNode, OpenMode};
pub use fs::{Filesystem, FilesystemBuilder, FsContext};
pub use list_reader::ListReader;
pub use local::{LocalFile, LocalStore};
pub use object::{Object, ObjectKind, Stat, TypeCheckerRegistry};
pub use volume_key::VolumeKey;
pub use xattr::{StaticXattr, XattrFlags};
