//! Wire-format metadata constants.
//!
//! These names are what the engine writes into provider metadata headers
//! and object bodies; they are kept byte-identical to the historical
//! `s3fuse` on-bucket format so existing buckets stay mountable.

/// Prefix of all engine-reserved metadata keys.
pub const RESERVED_PREFIX: &str = "s3fuse-";

/// Prefix under which non-header-safe xattrs are serialized.
pub const XATTR_PREFIX: &str = "xattr_";

/// Reserved prefix of in-bucket internal objects (hidden from listings).
pub const INTERNAL_OBJECT_PREFIX: &str = "$s3fuse$_";

/// Mode bits (octal string).
pub const MODE: &str = "s3fuse-mode";
/// Owner uid.
pub const UID: &str = "s3fuse-uid";
/// Owner gid.
pub const GID: &str = "s3fuse-gid";
/// Modification time (unix seconds).
pub const MTIME: &str = "s3fuse-mtime";
/// ETag observed when mtime was last written.
pub const MTIME_ETAG: &str = "s3fuse-mtime-etag";
/// Quoted-hex MD5 of the object body.
pub const MD5: &str = "s3fuse-md5";
/// ETag observed when the MD5 was last written.
pub const MD5_ETAG: &str = "s3fuse-md5-etag";
/// Hex root of the chunked SHA-256 list over the plaintext.
pub const SHA256: &str = "s3fuse-sha256";
/// Hex IV of the per-file encryption envelope.
pub const ENC_IV: &str = "s3fuse-enc-iv";
/// Hex ciphertext of the per-file encryption envelope.
pub const ENC_METADATA: &str = "s3fuse-enc-meta";

/// Content type marking symlink objects.
pub const SYMLINK_CONTENT_TYPE: &str = "text/symlink";
/// Content type marking FIFO marker objects.
pub const FIFO_CONTENT_TYPE: &str = "binary/s3fuse-fifo_0100";
/// Content type marking encrypted file objects (format version 1.0).
pub const ENCRYPTED_CONTENT_TYPE: &str = "binary/encrypted-s3fuse-file_0100";

/// Version marker prefixing a decrypted volume key.
pub const VOLUME_KEY_MARKER: &str = "s3fuse-00 ";
/// Verifier prefixing a decrypted per-file envelope.
pub const ENVELOPE_VERIFIER: &str = "s3fuse_enc_meta ";

/// Whether a bucket-relative path names an internal object.
#[must_use]
pub fn is_internal_path(path: &str) -> bool {
    path.starts_with(INTERNAL_OBJECT_PREFIX)
}

/// The bucket-relative path of an internal object.
#[must_use]
pub fn internal_path(name: &str) -> String {
    format!("{INTERNAL_OBJECT_PREFIX}{name}")
}
