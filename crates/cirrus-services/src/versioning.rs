//! Object-versioning helper.
//!
//! Versioning is never exposed through the filesystem; this helper backs
//! the maintenance flow that lists a key's versions and deletes everything
//! but the current one. Only AWS implements it.

use cirrus_core::{Error, Result, url_encode};
use cirrus_transport::{HttpMethod, Request, status};
use tracing::debug;

use crate::xml::{self, VersionEntry};

/// One version of one object.
pub type ObjectVersion = VersionEntry;

/// All versions under a prefix, in response order.
#[derive(Debug, Clone, Default)]
pub struct VersionList {
    /// The version entries.
    pub versions: Vec<ObjectVersion>,
}

impl VersionList {
    /// The entries that a purge would delete: everything that is not the
    /// latest version of its key, plus delete markers.
    #[must_use]
    pub fn purgeable(&self) -> Vec<&ObjectVersion> {
        self.versions
            .iter()
            .filter(|v| !v.is_latest || v.is_delete_marker)
            .collect()
    }
}

/// Lists and purges object versions.
pub trait ObjectVersioning: Send + Sync {
    /// List every version of every key under `prefix`.
    ///
    /// # Errors
    ///
    /// Transfer and parse failures.
    fn list_versions(
        &self,
        request: &mut Request,
        bucket_url: &str,
        prefix: &str,
    ) -> Result<VersionList>;

    /// Delete all purgeable versions under `prefix`. Returns how many
    /// versions were removed.
    ///
    /// # Errors
    ///
    /// Transfer failures; the purge stops at the first failed delete.
    fn purge_versions(
        &self,
        request: &mut Request,
        bucket_url: &str,
        prefix: &str,
    ) -> Result<usize>;
}

/// AWS `?versions` implementation.
#[derive(Debug, Default)]
pub struct AwsVersioning;

impl AwsVersioning {
    /// Create the helper.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ObjectVersioning for AwsVersioning {
    fn list_versions(
        &self,
        request: &mut Request,
        bucket_url: &str,
        prefix: &str,
    ) -> Result<VersionList> {
        let mut list = VersionList::default();
        let mut key_marker = String::new();
        let mut version_marker = String::new();

        loop {
            let mut query = format!("prefix={}", url_encode(prefix));
            if !key_marker.is_empty() {
                query.push_str(&format!(
                    "&key-marker={}&version-id-marker={version_marker}",
                    url_encode(&key_marker)
                ));
            }

            request.init(HttpMethod::Get);
            request.set_url(&format!("{bucket_url}?versions"), &query);
            request.run(None)?;

            if request.response_code() != status::OK {
                return Err(Error::Http(request.response_code()));
            }

            let page = xml::parse_version_page(request.output_buffer())?;
            list.versions.extend(page.versions);

            if !page.is_truncated {
                return Ok(list);
            }

            key_marker = page.next_key_marker.unwrap_or_default();
            version_marker = page.next_version_id_marker.unwrap_or_default();
        }
    }

    fn purge_versions(
        &self,
        request: &mut Request,
        bucket_url: &str,
        prefix: &str,
    ) -> Result<usize> {
        let list = self.list_versions(request, bucket_url, prefix)?;
        let mut purged = 0usize;

        for version in list.purgeable() {
            debug!(key = %version.key, version_id = %version.version_id, "purging version");

            request.init(HttpMethod::Delete);
            request.set_url(
                &format!(
                    "{bucket_url}/{}?versionId={}",
                    url_encode(&version.key),
                    version.version_id
                ),
                "",
            );
            request.run(None)?;

            match request.response_code() {
                status::NO_CONTENT | status::OK => purged += 1,
                code => return Err(Error::Http(code)),
            }
        }

        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use cirrus_transport::mock::{MockTransport, Script};
    use cirrus_transport::{RequestContext, Watchdog};

    use super::*;

    fn versioned_entry(key: &str, vid: &str, latest: bool) -> ObjectVersion {
        ObjectVersion {
            key: key.to_owned(),
            version_id: vid.to_owned(),
            is_latest: latest,
            is_delete_marker: false,
        }
    }

    #[test]
    fn test_should_select_purgeable_versions() {
        let list = VersionList {
            versions: vec![
                versioned_entry("a", "v2", true),
                versioned_entry("a", "v1", false),
                ObjectVersion {
                    key: "b".to_owned(),
                    version_id: "v9".to_owned(),
                    is_latest: true,
                    is_delete_marker: true,
                },
            ],
        };

        let purgeable = list.purgeable();
        assert_eq!(purgeable.len(), 2);
        assert_eq!(purgeable[0].version_id, "v1");
        assert_eq!(purgeable[1].version_id, "v9");
    }

    #[test]
    fn test_should_purge_old_versions() {
        let script = Script::new();
        script.push_response(
            200,
            &[],
            br"<ListVersionsResult>
  <IsTruncated>false</IsTruncated>
  <Version><Key>a</Key><VersionId>v2</VersionId><IsLatest>true</IsLatest></Version>
  <Version><Key>a</Key><VersionId>v1</VersionId><IsLatest>false</IsLatest></Version>
</ListVersionsResult>",
        );
        script.push_response(204, &[], b"");

        let watchdog = Watchdog::start(Duration::from_secs(3600));
        let context = Arc::new(RequestContext {
            transport_factory: MockTransport::factory(script.clone()),
            hook: None,
            watchdog: Arc::clone(&watchdog),
            max_transfer_retries: 3,
            default_timeout: Duration::from_secs(5),
            verbose: false,
        });
        let mut request = Request::new(context);

        let purged = AwsVersioning::new()
            .purge_versions(&mut request, "/bucket", "a")
            .expect("purge");
        assert_eq!(purged, 1);

        let delete = script.last_request().expect("captured");
        assert_eq!(delete.url, "/bucket/a?versionId=v1");
        watchdog.terminate();
    }

    #[test]
    fn test_should_page_version_listing() {
        let script = Script::new();
        script.push_response(
            200,
            &[],
            br"<ListVersionsResult>
  <IsTruncated>true</IsTruncated>
  <NextKeyMarker>a</NextKeyMarker>
  <NextVersionIdMarker>v1</NextVersionIdMarker>
  <Version><Key>a</Key><VersionId>v2</VersionId><IsLatest>true</IsLatest></Version>
</ListVersionsResult>",
        );
        script.push_response(
            200,
            &[],
            br"<ListVersionsResult>
  <IsTruncated>false</IsTruncated>
  <Version><Key>a</Key><VersionId>v1</VersionId><IsLatest>false</IsLatest></Version>
</ListVersionsResult>",
        );

        let watchdog = Watchdog::start(Duration::from_secs(3600));
        let context = Arc::new(RequestContext {
            transport_factory: MockTransport::factory(script.clone()),
            hook: None,
            watchdog: Arc::clone(&watchdog),
            max_transfer_retries: 3,
            default_timeout: Duration::from_secs(5),
            verbose: false,
        });
        let mut request = Request::new(context);

        let list = AwsVersioning::new()
            .list_versions(&mut request, "/bucket", "a")
            .expect("list");
        assert_eq!(list.versions.len(), 2);

        let second = script.last_request().expect("captured");
        assert!(second.url.contains("key-marker=a"));
        assert!(second.url.contains("version-id-marker=v1"));
        watchdog.terminate();
    }
}
