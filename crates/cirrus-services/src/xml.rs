//! Parsing of the provider XML responses the engine consumes.
//!
//! A small path-stack reader over `quick-xml` events; element names are
//! matched by local name so responses with or without a default namespace
//! parse the same way.

use cirrus_core::{Error, Result};
use quick_xml::Reader;
use quick_xml::events::Event;

/// One page of a `ListObjects`-style response.
#[derive(Debug, Clone, Default)]
pub struct ListBucketPage {
    /// Whether more pages follow.
    pub is_truncated: bool,
    /// Object keys on this page, in order.
    pub keys: Vec<String>,
    /// Grouped common prefixes on this page, in order.
    pub common_prefixes: Vec<String>,
    /// Server-provided continuation marker, when the provider sends one.
    pub next_marker: Option<String>,
}

/// One version entry of a `ListVersions` response.
#[derive(Debug, Clone)]
pub struct VersionEntry {
    /// The object key.
    pub key: String,
    /// The version id.
    pub version_id: String,
    /// Whether this is the current version.
    pub is_latest: bool,
    /// Whether this entry is a delete marker.
    pub is_delete_marker: bool,
}

/// A parsed `ListVersionsResult`.
#[derive(Debug, Clone, Default)]
pub struct VersionPage {
    /// Whether more pages follow.
    pub is_truncated: bool,
    /// Version entries in response order.
    pub versions: Vec<VersionEntry>,
    /// Continuation key marker.
    pub next_key_marker: Option<String>,
    /// Continuation version-id marker.
    pub next_version_id_marker: Option<String>,
}

/// Parse a `ListBucketResult` page.
///
/// # Errors
///
/// Returns [`Error::Xml`] for malformed XML.
pub fn parse_list_bucket_page(xml: &[u8]) -> Result<ListBucketPage> {
    let mut page = ListBucketPage::default();

    walk(xml, |path, text| match path {
        "ListBucketResult/IsTruncated" => page.is_truncated = text == "true",
        "ListBucketResult/Contents/Key" => page.keys.push(text.to_owned()),
        "ListBucketResult/CommonPrefixes/Prefix" => {
            page.common_prefixes.push(text.to_owned());
        }
        "ListBucketResult/NextMarker" => page.next_marker = Some(text.to_owned()),
        _ => {}
    })?;

    Ok(page)
}

/// Parse an `InitiateMultipartUploadResult`, returning the upload id.
///
/// # Errors
///
/// Returns [`Error::Xml`] for malformed XML or a missing/empty
/// `UploadId`.
pub fn parse_initiate_multipart(xml: &[u8]) -> Result<String> {
    let mut upload_id = String::new();

    walk(xml, |path, text| {
        if path == "InitiateMultipartUploadResult/UploadId" {
            upload_id = text.to_owned();
        }
    })?;

    if upload_id.is_empty() {
        return Err(Error::Xml("missing UploadId".to_owned()));
    }
    Ok(upload_id)
}

/// Parse a `CompleteMultipartUploadResult`, returning the final ETag.
///
/// # Errors
///
/// Returns [`Error::Xml`] for malformed XML or a missing/empty `ETag`.
pub fn parse_complete_multipart(xml: &[u8]) -> Result<String> {
    let mut etag = String::new();

    walk(xml, |path, text| {
        if path == "CompleteMultipartUploadResult/ETag" {
            etag = text.to_owned();
        }
    })?;

    if etag.is_empty() {
        return Err(Error::Xml("no etag in multipart completion".to_owned()));
    }
    Ok(etag)
}

/// Extract the ETag from a `CopyObjectResult` body, if present and
/// well-formed.
#[must_use]
pub fn parse_copy_object_etag(xml: &[u8]) -> Option<String> {
    let mut etag = String::new();

    walk(xml, |path, text| {
        if path == "CopyObjectResult/ETag" {
            etag = text.to_owned();
        }
    })
    .ok()?;

    (!etag.is_empty()).then_some(etag)
}

/// Parse a `ListVersionsResult` page.
///
/// # Errors
///
/// Returns [`Error::Xml`] for malformed XML.
pub fn parse_version_page(xml: &[u8]) -> Result<VersionPage> {
    let mut page = VersionPage::default();
    // `Version` and `DeleteMarker` entries share their field names.
    let mut current: Option<VersionEntry> = None;

    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut path: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Err(e) => return Err(Error::Xml(e.to_string())),
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                if path.len() == 1 && (name == "Version" || name == "DeleteMarker") {
                    current = Some(VersionEntry {
                        key: String::new(),
                        version_id: String::new(),
                        is_latest: false,
                        is_delete_marker: name == "DeleteMarker",
                    });
                }
                path.push(name);
            }
            Ok(Event::End(_)) => {
                if path.len() == 2 {
                    if let Some(entry) = current.take() {
                        page.versions.push(entry);
                    }
                }
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .decode()
                    .map_err(|e| Error::Xml(e.to_string()))?
                    .into_owned();

                match (path.len(), current.as_mut()) {
                    (3, Some(entry)) => match path[2].as_str() {
                        "Key" => entry.key = text,
                        "VersionId" => entry.version_id = text,
                        "IsLatest" => entry.is_latest = text == "true",
                        _ => {}
                    },
                    (2, None) => match path[1].as_str() {
                        "IsTruncated" => page.is_truncated = text == "true",
                        "NextKeyMarker" => page.next_key_marker = Some(text),
                        "NextVersionIdMarker" => page.next_version_id_marker = Some(text),
                        _ => {}
                    },
                    _ => {}
                }
            }
            Ok(_) => {}
        }
    }

    Ok(page)
}

fn local_name(name: &[u8]) -> String {
    let name = match name.iter().position(|&b| b == b':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    };
    String::from_utf8_lossy(name).into_owned()
}

fn walk(xml: &[u8], mut visit: impl FnMut(&str, &str)) -> Result<()> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut path: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Err(e) => return Err(Error::Xml(e.to_string())),
            Ok(Event::Eof) => return Ok(()),
            Ok(Event::Start(e)) => path.push(local_name(e.name().as_ref())),
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t.decode().map_err(|e| Error::Xml(e.to_string()))?;
                visit(&path.join("/"), &text);
            }
            Ok(_) => {}
        }
    }
}
