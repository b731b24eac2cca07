//! Cryptographic primitives for the cirrus engine.
//!
//! Thin, typed wrappers over the RustCrypto crates: hex/base64 codecs,
//! MD5/SHA-256/HMAC-SHA1 digests, AES-CBC-256 (PKCS#7) and AES-CTR-256
//! ciphers with byte-offset seek, PBKDF2-SHA1 key derivation, chunked hash
//! lists, symmetric key material, owner-only credential files, and
//! terminal password entry.

mod buffer;
mod cipher;
mod digests;
mod encoding;
mod hash_list;
mod kdf;
mod passwords;
mod private_file;
mod symmetric_key;

pub use buffer::SecretBuffer;
pub use cipher::{AesCbc256, AesCtr256, CTR_BLOCK_LEN};
pub use digests::{HmacSha1, Md5, Sha256, md5_file, sha256_file};
pub use encoding::{
    base64_decode, base64_encode, hex_decode, hex_encode, hex_encode_quoted,
};
pub use hash_list::{HASH_LIST_CHUNK_SIZE, Sha256HashList};
pub use kdf::derive_pbkdf2_sha1;
pub use passwords::read_password;
pub use private_file::{read_private_file, write_private_file};
pub use symmetric_key::SymmetricKey;

/// Error type for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Input could not be decoded (hex/base64).
    #[error("decode error: {0}")]
    Decode(String),
    /// Ciphertext or padding is malformed, or a key/IV has the wrong size.
    #[error("cipher error: {0}")]
    Cipher(String),
    /// A key string or envelope is malformed.
    #[error("malformed key material: {0}")]
    MalformedKey(String),
    /// A private file failed its permission or I/O checks.
    #[error("private file error: {0}")]
    PrivateFile(String),
}
