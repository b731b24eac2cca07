//! Stateful pager over the bucket listing RPC.

use cirrus_core::{Error, Result, url_encode};
use cirrus_transport::{HttpMethod, Request, status};

use crate::fs::FsContext;

/// Pages through a `ListObjects`-style listing.
///
/// `read` returns a positive count while the listing advances, `0` once
/// exhausted. Between pages the reader tracks a marker: the
/// server-provided `NextMarker` when the provider sends one, else the
/// last key of the page.
#[derive(Debug)]
pub struct ListReader {
    prefix: String,
    group_common_prefixes: bool,
    max_keys: Option<u64>,
    marker: String,
    truncated: bool,
}

impl ListReader {
    /// Create a pager over `prefix`, grouping common prefixes with the
    /// `/` delimiter.
    #[must_use]
    pub fn new(prefix: &str, group_common_prefixes: bool, max_keys: Option<u64>) -> Self {
        Self {
            prefix: prefix.to_owned(),
            group_common_prefixes,
            max_keys,
            marker: String::new(),
            truncated: true,
        }
    }

    /// Fetch the next page into `keys` and `prefixes`.
    ///
    /// # Errors
    ///
    /// Transfer and parse failures.
    pub fn read(
        &mut self,
        context: &FsContext,
        request: &mut Request,
        keys: &mut Vec<String>,
        prefixes: Option<&mut Vec<String>>,
    ) -> Result<usize> {
        keys.clear();
        let prefixes = prefixes.map(|p| {
            p.clear();
            p
        });

        if !self.truncated {
            return Ok(0);
        }

        let mut query = format!(
            "prefix={}&marker={}",
            url_encode(&self.prefix),
            url_encode(&self.marker)
        );
        if self.group_common_prefixes {
            query.push_str("&delimiter=/");
        }
        if let Some(max_keys) = self.max_keys {
            query.push_str(&format!("&max-keys={max_keys}"));
        }

        request.init(HttpMethod::Get);
        request.set_url(context.service.bucket_url(), &query);
        request.run(None)?;

        if request.response_code() != status::OK {
            return Err(Error::Http(request.response_code()));
        }

        let page = cirrus_services::xml::parse_list_bucket_page(request.output_buffer())?;

        self.truncated = page.is_truncated;
        if self.truncated {
            if context.service.is_next_marker_supported() {
                self.marker = page.next_marker.clone().ok_or_else(|| {
                    Error::Xml("truncated listing without NextMarker".to_owned())
                })?;
            } else if let Some(last) = page.keys.last() {
                self.marker = last.clone();
            } else {
                // A truncated page with no keys cannot advance.
                self.truncated = false;
            }
        }

        *keys = page.keys;
        let mut count = keys.len();

        if let Some(prefixes) = prefixes {
            *prefixes = page.common_prefixes;
            count += prefixes.len();
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests_support::test_context_with_handler;
    use cirrus_transport::TransportResponse;
    use std::sync::Arc;

    fn page(truncated: bool, next: Option<&str>, keys: &[&str], prefixes: &[&str]) -> Vec<u8> {
        let mut xml = String::from("<ListBucketResult>");
        xml.push_str(&format!("<IsTruncated>{truncated}</IsTruncated>"));
        if let Some(next) = next {
            xml.push_str(&format!("<NextMarker>{next}</NextMarker>"));
        }
        for key in keys {
            xml.push_str(&format!("<Contents><Key>{key}</Key></Contents>"));
        }
        for prefix in prefixes {
            xml.push_str(&format!(
                "<CommonPrefixes><Prefix>{prefix}</Prefix></CommonPrefixes>"
            ));
        }
        xml.push_str("</ListBucketResult>");
        xml.into_bytes()
    }

    #[test]
    fn test_should_page_until_exhausted() {
        let pages = Arc::new(parking_lot::Mutex::new(vec![
            page(true, None, &["dir/a", "dir/b"], &["dir/sub/"]),
            page(false, None, &["dir/c"], &[]),
        ]));
        let pages_clone = Arc::clone(&pages);

        let (harness, _watchdog) = test_context_with_handler(Arc::new(move |req| {
            assert!(req.url.contains("prefix=dir/"));
            assert!(req.url.contains("delimiter=/"));
            let mut pages = pages_clone.lock();
            let body = if pages.is_empty() {
                page(false, None, &[], &[])
            } else {
                pages.remove(0)
            };
            Ok(TransportResponse {
                status: 200,
                headers: std::collections::BTreeMap::new(),
                body,
            })
        }));

        let mut reader = ListReader::new("dir/", true, None);
        let mut keys = Vec::new();
        let mut prefixes = Vec::new();
        let mut all_keys = Vec::new();

        let mut request = harness.make_request();
        loop {
            let n = reader
                .read(&harness.context, &mut request, &mut keys, Some(&mut prefixes))
                .expect("read");
            if n == 0 {
                break;
            }
            all_keys.extend(keys.iter().cloned());
        }

        assert_eq!(all_keys, vec!["dir/a", "dir/b", "dir/c"]);
    }

    #[test]
    fn test_should_use_last_key_as_marker_without_next_marker_support() {
        let seen_markers = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen_markers);
        let served = Arc::new(parking_lot::Mutex::new(0usize));
        let served_clone = Arc::clone(&served);

        let (harness, _watchdog) = test_context_with_handler(Arc::new(move |req| {
            seen_clone.lock().push(req.url.clone());
            let mut served = served_clone.lock();
            *served += 1;
            let body = if *served == 1 {
                page(true, None, &["a", "b"], &[])
            } else {
                page(false, None, &["c"], &[])
            };
            Ok(TransportResponse {
                status: 200,
                headers: std::collections::BTreeMap::new(),
                body,
            })
        }));

        let mut reader = ListReader::new("", false, None);
        let mut keys = Vec::new();
        let mut request = harness.make_request();

        while reader
            .read(&harness.context, &mut request, &mut keys, None)
            .expect("read")
            > 0
        {}

        let urls = seen_markers.lock();
        assert!(urls[0].contains("marker=&") || urls[0].ends_with("marker="));
        assert!(urls[1].contains("marker=b"));
    }

    #[test]
    fn test_should_pass_max_keys() {
        let (harness, _watchdog) = test_context_with_handler(Arc::new(move |req| {
            assert!(req.url.contains("max-keys=2"));
            Ok(TransportResponse {
                status: 200,
                headers: std::collections::BTreeMap::new(),
                body: page(false, None, &["x"], &[]),
            })
        }));

        let mut reader = ListReader::new("x", false, Some(2));
        let mut keys = Vec::new();
        let mut request = harness.make_request();
        reader
            .read(&harness.context, &mut request, &mut keys, None)
            .expect("read");
        assert_eq!(keys, vec!["x"]);
    }
}
