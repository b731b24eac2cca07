//! MD5, SHA-256, and HMAC-SHA1 digest helpers.
//!
//! One-shot digests return a fixed-size array; rendering helpers live in
//! [`crate::encoding`]. File digests stream in 128 KiB blocks so large
//! local backing files never get buffered whole.

use std::io::Read;

use digest::Digest;
use hmac::{Hmac, Mac};

/// MD5 digest length in bytes.
pub const MD5_LEN: usize = 16;
/// SHA-256 digest length in bytes.
pub const SHA256_LEN: usize = 32;
/// HMAC-SHA1 MAC length in bytes.
pub const HMAC_SHA1_LEN: usize = 20;

const FILE_READ_BLOCK: usize = 128 * 1024;

/// One-shot MD5.
#[derive(Debug)]
pub struct Md5;

impl Md5 {
    /// Digest a byte slice.
    #[must_use]
    pub fn digest(data: &[u8]) -> [u8; MD5_LEN] {
        md5::Md5::digest(data).into()
    }

    /// Hex digest of a byte slice.
    #[must_use]
    pub fn hex(data: &[u8]) -> String {
        hex::encode(Self::digest(data))
    }

    /// Quoted hex digest (ETag form) of a byte slice.
    #[must_use]
    pub fn hex_quoted(data: &[u8]) -> String {
        crate::hex_encode_quoted(&Self::digest(data))
    }

    /// Base64 digest, the form the `Content-MD5` header wants.
    #[must_use]
    pub fn base64(data: &[u8]) -> String {
        crate::base64_encode(&Self::digest(data))
    }
}

/// One-shot SHA-256.
#[derive(Debug)]
pub struct Sha256;

impl Sha256 {
    /// Digest a byte slice.
    #[must_use]
    pub fn digest(data: &[u8]) -> [u8; SHA256_LEN] {
        sha2::Sha256::digest(data).into()
    }

    /// Hex digest of a byte slice.
    #[must_use]
    pub fn hex(data: &[u8]) -> String {
        hex::encode(Self::digest(data))
    }
}

/// HMAC-SHA1 message authentication, as used by SigV2-era request signing.
#[derive(Debug)]
pub struct HmacSha1;

impl HmacSha1 {
    /// MAC `data` under `key`.
    #[must_use]
    pub fn sign(key: &[u8], data: &[u8]) -> [u8; HMAC_SHA1_LEN] {
        let mut mac =
            Hmac::<sha1::Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }
}

/// Stream a reader and return its quoted-hex MD5 (ETag form).
///
/// # Errors
///
/// Propagates read failures.
pub fn md5_file(reader: &mut impl Read) -> std::io::Result<String> {
    let mut hasher = md5::Md5::new();
    stream_into(reader, |chunk| Digest::update(&mut hasher, chunk))?;
    Ok(crate::hex_encode_quoted(&hasher.finalize()))
}

/// Stream a reader and return its hex SHA-256.
///
/// # Errors
///
/// Propagates read failures.
pub fn sha256_file(reader: &mut impl Read) -> std::io::Result<String> {
    let mut hasher = sha2::Sha256::new();
    stream_into(reader, |chunk| Digest::update(&mut hasher, chunk))?;
    Ok(hex::encode(hasher.finalize()))
}

fn stream_into(reader: &mut impl Read, mut update: impl FnMut(&[u8])) -> std::io::Result<()> {
    let mut buf = vec![0u8; FILE_READ_BLOCK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        update(&buf[..n]);
    }
}
