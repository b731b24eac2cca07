//! The provider abstraction.

use std::sync::Arc;

use cirrus_core::{Config, Error, Result, ServiceKind};
use cirrus_transport::{RequestHook, TransportFactory, Watchdog};

use crate::versioning::ObjectVersioning;
use crate::{AwsService, FvsService, GsService};

/// Which multipart upload strategy a provider supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartCapability {
    /// Initiate / numbered parts / complete with an ETag list.
    AwsStyle,
    /// Resumable upload against a session URL, parts serialized.
    GcsResumable,
}

/// A storage provider: header conventions, URL shaping, signing, and
/// transfer capabilities.
pub trait StorageService: Send + Sync {
    /// Prefix of provider headers (`x-amz-`).
    fn header_prefix(&self) -> &'static str;

    /// Prefix of provider metadata headers (`x-amz-meta-`).
    fn header_meta_prefix(&self) -> &'static str;

    /// The bucket-relative URL root (`/` + url-encoded bucket name).
    fn bucket_url(&self) -> &str;

    /// Whether listings return a `NextMarker` element.
    fn is_next_marker_supported(&self) -> bool;

    /// The hook that shapes and signs this provider's requests.
    fn hook(&self) -> Arc<dyn RequestHook>;

    /// The multipart upload strategy.
    fn multipart(&self) -> MultipartCapability;

    /// The object-versioning helper, when the provider has one.
    fn versioning(&self) -> Option<Arc<dyn ObjectVersioning>> {
        None
    }
}

/// Build the configured provider.
///
/// GCS needs to issue its own token-endpoint requests, which is why the
/// factory takes the transport factory and watchdog.
///
/// # Errors
///
/// Credential files that are missing, malformed, or too permissive, and
/// (for GCS) a failed initial token refresh.
pub fn create_service(
    config: &Config,
    transport_factory: Box<TransportFactory>,
    watchdog: &Arc<Watchdog>,
) -> Result<Arc<dyn StorageService>> {
    match config.service {
        ServiceKind::Aws => Ok(Arc::new(AwsService::new(config)?)),
        ServiceKind::Fvs => Ok(Arc::new(FvsService::new(config)?)),
        ServiceKind::GoogleStorage => Ok(Arc::new(GsService::new(
            config,
            transport_factory,
            watchdog,
        )?)),
    }
}

/// Parse a `key-id secret` credential line.
pub(crate) fn parse_secret_line(line: &str, what: &str) -> Result<(String, String)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 2 {
        return Err(Error::Invalid(format!(
            "expected 2 fields for {what}, found {}",
            fields.len()
        )));
    }
    Ok((fields[0].to_owned(), fields[1].to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_parse_secret_line() {
        let (key, secret) = parse_secret_line("AKID  s3cr3t", "test").expect("parse");
        assert_eq!(key, "AKID");
        assert_eq!(secret, "s3cr3t");
    }

    #[test]
    fn test_should_reject_malformed_secret_line() {
        assert!(parse_secret_line("only-one-field", "test").is_err());
        assert!(parse_secret_line("a b c", "test").is_err());
        assert!(parse_secret_line("", "test").is_err());
    }
}
