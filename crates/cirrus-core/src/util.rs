//! Small time, path, and URL helpers.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Characters passed through unescaped in object URLs, beyond
/// alphanumerics: `/ . - * _`. Spaces become `%20`, never `+`.
const URL_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'.')
    .remove(b'-')
    .remove(b'*')
    .remove(b'_');

/// Percent-encode an object path for use in a URL.
#[must_use]
pub fn url_encode(path: &str) -> String {
    utf8_percent_encode(path, URL_SAFE).to_string()
}

/// Current time formatted per RFC 1123 for the `Date` header.
#[must_use]
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Whether `etag` looks like a single-part upload ETag, i.e. a quoted
/// 32-digit lowercase hex MD5. Multipart ETags (`"...-N"`) do not match.
#[must_use]
pub fn is_valid_quoted_md5_etag(etag: &str) -> bool {
    let bytes = etag.as_bytes();
    bytes.len() == 34
        && bytes[0] == b'"'
        && bytes[33] == b'"'
        && bytes[1..33]
            .iter()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
}

/// The parent of a bucket-relative path (`""` for top-level names).
#[must_use]
pub fn parent_path(path: &str) -> &str {
    path.rfind('/').map_or("", |pos| &path[..pos])
}

/// The last component of a bucket-relative path.
#[must_use]
pub fn base_name(path: &str) -> &str {
    path.rfind('/').map_or(path, |pos| &path[pos + 1..])
}
