//! IIJ GIO storage & analysis ("FVS") service adapter.
//!
//! S3-compatible, with its own header prefix (`x-iijgio-`) and auth label
//! (`IIJGIO`); listings do not return a `NextMarker`.

use std::sync::Arc;

use cirrus_core::{Config, Error, Result, url_encode};
use cirrus_crypto::read_private_file;
use cirrus_transport::RequestHook;

use crate::aws::HmacSigningHook;
use crate::service::parse_secret_line;
use crate::{MultipartCapability, StorageService};

/// The IIJ GIO provider.
pub struct FvsService {
    hook: Arc<HmacSigningHook>,
    bucket_url: String,
}

impl std::fmt::Debug for FvsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FvsService")
            .field("bucket_url", &self.bucket_url)
            .finish_non_exhaustive()
    }
}

impl FvsService {
    /// Build from configuration, reading the secret file.
    ///
    /// # Errors
    ///
    /// Returns an error when the secret file is missing, malformed, or
    /// not owner-only.
    pub fn new(config: &Config) -> Result<Self> {
        let line = read_private_file(&config.fvs_secret_file)
            .map_err(|e| Error::Invalid(e.to_string()))?;
        let (key, secret) = parse_secret_line(&line, "fvs_secret_file")?;

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
                "IIJGIO",
                "x-iijgio-",
                key,
                secret,
                endpoint_prefix,
            )),
            bucket_url,
        }
    }
}

impl StorageService for FvsService {
    fn header_prefix(&self) -> &'static str {
        "x-iijgio-"
    }

    fn header_meta_prefix(&self) -> &'static str {
        "x-iijgio-meta-"
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_expose_fvs_conventions() {
        let config = Config {
            bucket_name: "bucket".to_owned(),
            endpoint: "storage.example.jp".to_owned(),
            ..Config::default()
        };
        let service = FvsService::with_credentials(&config, "k".into(), "s".into());

        assert_eq!(service.header_prefix(), "x-iijgio-");
        assert_eq!(service.header_meta_prefix(), "x-iijgio-meta-");
        assert!(!service.is_next_marker_supported());
        assert_eq!(service.multipart(), MultipartCapability::AwsStyle);
        assert!(service.versioning().is_none());
        assert_eq!(
            service.hook().adjust_url("/bucket/x"),
            "https://storage.example.jp/bucket/x"
        );
    }
}
