//! Hex and base64 codecs.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::CryptoError;

/// Encode bytes as lowercase hex.
#[must_use]
pub fn hex_encode(data: &[u8]) -> String {
    hex::encode(data)
}

/// Encode bytes as lowercase hex surrounded by double quotes, the form
/// S3 uses for single-part ETags.
#[must_use]
pub fn hex_encode_quoted(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(data))
}

/// Decode a hex string (quotes, if present, are not accepted).
///
/// # Errors
///
/// Returns [`CryptoError::Decode`] for non-hex input.
pub fn hex_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(s).map_err(|e| CryptoError::Decode(e.to_string()))
}

/// Encode bytes as standard base64.
#[must_use]
pub fn base64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode a standard base64 string.
///
/// # Errors
///
/// Returns [`CryptoError::Decode`] for invalid input.
pub fn base64_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64
        .decode(s)
        .map_err(|e| CryptoError::Decode(e.to_string()))
}
