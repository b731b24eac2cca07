//! Extended attributes.
//!
//! Stored xattrs live in provider metadata headers. A key or value that
//! is not HTTP-header-safe is serialized as
//! `xattr_<md5hex(key)>: base64(key) + " " + base64(value)`; safe pairs
//! pass through as-is. "Reference" attributes (live views of object
//! fields) are produced by the object enumerator, not stored here.

use cirrus_core::{Error, Result};
use cirrus_crypto::{Md5, base64_decode, base64_encode};

use crate::metadata;

const MAX_STRING_SCAN_LEN: usize = 128;

/// Behavior flags of an xattr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XattrFlags {
    /// Listed by `listxattr`.
    pub visible: bool,
    /// Accepts `setxattr`.
    pub writable: bool,
    /// Serialized into request headers on commit.
    pub serializable: bool,
    /// Accepts `removexattr`.
    pub removable: bool,
}

impl XattrFlags {
    /// Flags of a user-set attribute.
    #[must_use]
    pub fn user() -> Self {
        Self {
            visible: true,
            writable: true,
            serializable: true,
            removable: true,
        }
    }

    /// Flags of an engine-owned attribute (serialized but not mutable
    /// through the xattr API).
    #[must_use]
    pub fn reserved() -> Self {
        Self {
            visible: true,
            writable: false,
            serializable: true,
            removable: false,
        }
    }
}

/// A stored extended attribute.
#[derive(Debug, Clone)]
pub struct StaticXattr {
    key: String,
    value: Vec<u8>,
    encode_key: bool,
    encode_value: bool,
    flags: XattrFlags,
}

fn is_key_valid(key: &str) -> bool {
    if key.starts_with(metadata::RESERVED_PREFIX) || key.starts_with(metadata::XATTR_PREFIX) {
        return false;
    }

    key.chars()
        .all(|c| c == '.' || c == '-' || c == '_' || c.is_ascii_digit() || c.is_ascii_lowercase())
}

fn is_value_valid(value: &[u8]) -> bool {
    if value.len() > MAX_STRING_SCAN_LEN {
        return false;
    }

    value.iter().all(|&b| {
        b == b'/' || b == b'.' || b == b'-' || b == b'*' || b == b'_' || b.is_ascii_alphanumeric()
    })
}

impl StaticXattr {
    /// Create an empty attribute for `key`.
    #[must_use]
    pub fn create(key: &str, flags: XattrFlags) -> Self {
        Self {
            key: key.to_owned(),
            value: Vec::new(),
            encode_key: !is_key_valid(key),
            encode_value: true,
            flags,
        }
    }

    /// Create an attribute holding a string value.
    #[must_use]
    pub fn from_string(key: &str, value: &str, flags: XattrFlags) -> Self {
        let mut attr = Self::create(key, flags);
        attr.set_value(value.as_bytes());
        attr
    }

    /// Reconstruct an attribute from a metadata header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] for a malformed `xattr_`-encoded header.
    pub fn from_header(header_key: &str, header_value: &str, flags: XattrFlags) -> Result<Self> {
        if header_key.starts_with(metadata::XATTR_PREFIX) {
            let (enc_key, enc_value) = header_value
                .split_once(' ')
                .ok_or_else(|| Error::Invalid("malformed encoded xattr header".to_owned()))?;

            let key_bytes =
                base64_decode(enc_key).map_err(|e| Error::Invalid(e.to_string()))?;
            let key = String::from_utf8(key_bytes)
                .map_err(|_| Error::Invalid("xattr key is not UTF-8".to_owned()))?;
            let value = base64_decode(enc_value).map_err(|e| Error::Invalid(e.to_string()))?;

            Ok(Self {
                key,
                value,
                encode_key: true,
                encode_value: true,
                flags,
            })
        } else {
            // Came to us as a valid HTTP header, so no encoding needed.
            Ok(Self {
                key: header_key.to_owned(),
                value: header_value.as_bytes().to_vec(),
                encode_key: false,
                encode_value: false,
                flags,
            })
        }
    }

    /// The attribute key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The behavior flags.
    #[must_use]
    pub fn flags(&self) -> XattrFlags {
        self.flags
    }

    /// Replace the value.
    pub fn set_value(&mut self, value: &[u8]) {
        self.value = value.to_vec();
        self.encode_value = !is_value_valid(value);
    }

    /// Copy the value into `buffer`.
    ///
    /// With no buffer, returns the value size. With a buffer too small,
    /// copies a prefix and returns [`Error::Invalid`]-free `-ERANGE`
    /// semantics via `Err`; the bridge maps it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] when the value does not fit.
    pub fn get_value(&self, buffer: Option<&mut [u8]>) -> Result<usize> {
        match buffer {
            None => Ok(self.value.len()),
            Some(buffer) => {
                let n = self.value.len().min(buffer.len());
                buffer[..n].copy_from_slice(&self.value[..n]);

                if n == self.value.len() {
                    Ok(n)
                } else {
                    Err(Error::Invalid("buffer too small for xattr value".to_owned()))
                }
            }
        }
    }

    /// The raw value bytes.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Serialize into a `(header-key, header-value)` pair.
    #[must_use]
    pub fn to_header(&self) -> (String, String) {
        if self.encode_key || self.encode_value {
            (
                format!("{}{}", metadata::XATTR_PREFIX, Md5::hex(self.key.as_bytes())),
                format!(
                    "{} {}",
                    base64_encode(self.key.as_bytes()),
                    base64_encode(&self.value)
                ),
            )
        } else {
            (
                self.key.clone(),
                String::from_utf8_lossy(&self.value).into_owned(),
            )
        }
    }
}

/// Whether `key` may be set through the public xattr API.
#[must_use]
pub fn is_settable_key(key: &str) -> bool {
    !key.starts_with(metadata::RESERVED_PREFIX) && !key.starts_with(metadata::XATTR_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_pass_safe_pairs_through() {
        let attr = StaticXattr::from_string("user-key.1", "safe/value.txt", XattrFlags::user());
        let (header_key, header_value) = attr.to_header();
        assert_eq!(header_key, "user-key.1");
        assert_eq!(header_value, "safe/value.txt");
    }

    #[test]
    fn test_should_encode_unsafe_value() {
        let attr = StaticXattr::from_string("key", "value with spaces!", XattrFlags::user());
        let (header_key, header_value) = attr.to_header();
        assert!(header_key.starts_with(metadata::XATTR_PREFIX));
        assert!(header_value.contains(' '));
    }

    #[test]
    fn test_should_encode_unsafe_key() {
        let attr = StaticXattr::from_string("Key With Caps", "v", XattrFlags::user());
        let (header_key, _) = attr.to_header();
        assert_eq!(
            header_key,
            format!("{}{}", metadata::XATTR_PREFIX, Md5::hex(b"Key With Caps"))
        );
    }

    #[test]
    fn test_should_round_trip_through_header_encoding() {
        let value: Vec<u8> = (0u8..=255).collect();
        let mut attr = StaticXattr::create("binary.attr", XattrFlags::user());
        attr.set_value(&value);

        let (header_key, header_value) = attr.to_header();
        let parsed =
            StaticXattr::from_header(&header_key, &header_value, XattrFlags::user()).expect("parse");

        assert_eq!(parsed.key(), "binary.attr");
        assert_eq!(parsed.value(), value.as_slice());
    }

    #[test]
    fn test_should_round_trip_plain_header() {
        let parsed =
            StaticXattr::from_header("plainkey", "plainvalue", XattrFlags::user()).expect("parse");
        assert_eq!(parsed.key(), "plainkey");
        assert_eq!(parsed.value(), b"plainvalue");
        let (k, v) = parsed.to_header();
        assert_eq!((k.as_str(), v.as_str()), ("plainkey", "plainvalue"));
    }

    #[test]
    fn test_should_reject_malformed_encoded_header() {
        assert!(StaticXattr::from_header("xattr_abc", "no-separator", XattrFlags::user()).is_err());
        assert!(StaticXattr::from_header("xattr_abc", "!bad! !b64!", XattrFlags::user()).is_err());
    }

    #[test]
    fn test_should_encode_overlong_values() {
        let attr = StaticXattr::from_string("key", &"a".repeat(200), XattrFlags::user());
        let (header_key, _) = attr.to_header();
        assert!(header_key.starts_with(metadata::XATTR_PREFIX));
    }

    #[test]
    fn test_should_report_value_through_size_probe() {
        let attr = StaticXattr::from_string("k", "12345", XattrFlags::user());
        assert_eq!(attr.get_value(None).expect("size"), 5);

        let mut buf = [0u8; 5];
        assert_eq!(attr.get_value(Some(&mut buf)).expect("copy"), 5);
        assert_eq!(&buf, b"12345");

        let mut small = [0u8; 2];
        assert!(attr.get_value(Some(&mut small)).is_err());
        assert_eq!(&small, b"12");
    }

    #[test]
    fn test_should_refuse_reserved_keys() {
        assert!(!is_settable_key("s3fuse-mode"));
        assert!(!is_settable_key("xattr_00ff"));
        assert!(is_settable_key("ordinary"));
    }
}
