//! Configuration for the cirrus engine.
//!
//! Defaults match the documented surface; every field can be overridden
//! from the environment in the `CIRRUS_*` namespace. Configuration loading
//! from files is deliberately left to the embedding binary.

use serde::{Deserialize, Serialize};

/// Chunk size of the chunked hash list. Transfer chunk sizes must be
/// multiples of this so hash updates stay chunk-aligned.
pub const HASH_CHUNK_SIZE: u64 = 128 * 1024;

/// Minimum multipart part size accepted by AWS-style services.
pub const AWS_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// The storage service a mount talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// Amazon S3 (SigV2-era HMAC-SHA1 signing).
    Aws,
    /// Google Cloud Storage (OAuth2 bearer tokens).
    GoogleStorage,
    /// IIJ GIO storage & analysis ("FVS"), S3-compatible.
    Fvs,
}

impl ServiceKind {
    /// Parse the `service` configuration value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aws" => Some(Self::Aws),
            "google-storage" => Some(Self::GoogleStorage),
            "fvs" => Some(Self::Fvs),
            _ => None,
        }
    }

    /// Canonical configuration string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::GoogleStorage => "google-storage",
            Self::Fvs => "fvs",
        }
    }
}

/// Engine configuration.
///
/// `default_uid`/`default_gid` of `u32::MAX` mean "use the effective
/// uid/gid of the mounting process". An `upload_chunk_size` of `None`
/// selects the provider default (5 MiB for AWS/FVS, 256 KiB for GCS).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Which storage service to mount.
    pub service: ServiceKind,
    /// The bucket to mount.
    pub bucket_name: String,
    /// Service endpoint host (AWS/FVS).
    pub endpoint: String,
    /// Whether to reach the endpoint over TLS.
    pub use_ssl: bool,

    /// Private file holding `key-id secret` for AWS.
    pub aws_secret_file: String,
    /// Private file holding the GCS OAuth refresh token.
    pub gs_token_file: String,
    /// GCS project id header value (optional).
    pub gs_project_id: String,
    /// Private file holding `key-id secret` for FVS.
    pub fvs_secret_file: String,

    /// Metadata cache TTL in seconds.
    pub cache_expiry_seconds: u64,
    /// Whether directories memoize their child-name list.
    pub cache_directories: bool,
    /// Whether readdir warms the metadata cache with async HEADs.
    pub precache_on_readdir: bool,

    /// Download chunk size in bytes (multiple of 128 KiB).
    pub download_chunk_size: u64,
    /// Upload chunk size in bytes; `None` = provider default.
    pub upload_chunk_size: Option<u64>,
    /// How many times a transfer is retried before giving up.
    pub max_transfer_retries: u32,
    /// Maximum transfer parts in flight.
    pub max_parts_in_progress: usize,
    /// Deadline for metadata requests, in seconds.
    pub request_timeout_seconds: u64,
    /// Deadline for data transfer requests, in seconds.
    pub transfer_timeout_seconds: u64,

    /// Mode bits for objects without recorded mode.
    pub default_mode: u32,
    /// Owner uid for objects without recorded uid (`u32::MAX` = euid).
    pub default_uid: u32,
    /// Owner gid for objects without recorded gid (`u32::MAX` = egid).
    pub default_gid: u32,
    /// Content type assigned to newly created files.
    pub default_content_type: String,
    /// Whether to pick a content type from the file extension.
    pub auto_detect_mime_type: bool,

    /// Whether file contents are encrypted at rest.
    pub use_encryption: bool,
    /// Which volume key unlocks the bucket.
    pub volume_key_id: String,
    /// Private file holding the raw volume wrap key; empty = prompt.
    pub volume_key_file: String,

    /// Directory holding local backing files.
    pub local_store_path: String,
    /// High-water mark for the local store, in bytes (0 = unlimited).
    pub max_local_store_size: u64,
    /// Purge cadence of the local store monitor, in seconds.
    pub local_store_purge_period: u64,
    /// Keep backing files across close/open cycles.
    pub enable_local_store_persistence: bool,
    /// HEAD the object and compare etags before reusing a backing file.
    pub verify_etag_before_reopen: bool,

    /// File the statistics report is written to at teardown (empty = none).
    pub stats_file: String,
    /// Log every request at debug level.
    pub verbose_requests: bool,
    /// Prefix under which xattrs are exposed (`user.` on Linux).
    pub xattr_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceKind::Aws,
            bucket_name: String::new(),
            endpoint: "s3.amazonaws.com".to_owned(),
            use_ssl: true,
            aws_secret_file: String::new(),
            gs_token_file: String::new(),
            gs_project_id: String::new(),
            fvs_secret_file: String::new(),
            cache_expiry_seconds: 120,
            cache_directories: false,
            precache_on_readdir: true,
            download_chunk_size: 16 * 1024 * 1024,
            upload_chunk_size: None,
            max_transfer_retries: 5,
            max_parts_in_progress: 4,
            request_timeout_seconds: 30,
            transfer_timeout_seconds: 300,
            default_mode: 0o644,
            default_uid: u32::MAX,
            default_gid: u32::MAX,
            default_content_type: "binary/octet-stream".to_owned(),
            auto_detect_mime_type: false,
            use_encryption: false,
            volume_key_id: String::new(),
            volume_key_file: String::new(),
            local_store_path: "/tmp".to_owned(),
            max_local_store_size: 0,
            local_store_purge_period: 10,
            enable_local_store_persistence: false,
            verify_etag_before_reopen: false,
            stats_file: String::new(),
            verbose_requests: false,
            xattr_prefix: "user.".to_owned(),
        }
    }
}

impl Config {
    /// Load configuration from `CIRRUS_*` environment variables on top of
    /// the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("CIRRUS_SERVICE") {
            if let Some(kind) = ServiceKind::parse(&v) {
                config.service = kind;
            }
        }
        set_string(&mut config.bucket_name, "CIRRUS_BUCKET_NAME");
        set_string(&mut config.endpoint, "CIRRUS_ENDPOINT");
        set_bool(&mut config.use_ssl, "CIRRUS_USE_SSL");
        set_string(&mut config.aws_secret_file, "CIRRUS_AWS_SECRET_FILE");
        set_string(&mut config.gs_token_file, "CIRRUS_GS_TOKEN_FILE");
        set_string(&mut config.gs_project_id, "CIRRUS_GS_PROJECT_ID");
        set_string(&mut config.fvs_secret_file, "CIRRUS_FVS_SECRET_FILE");
        set_u64(&mut config.cache_expiry_seconds, "CIRRUS_CACHE_EXPIRY_SECONDS");
        set_bool(&mut config.cache_directories, "CIRRUS_CACHE_DIRECTORIES");
        set_bool(&mut config.precache_on_readdir, "CIRRUS_PRECACHE_ON_READDIR");
        set_u64(&mut config.download_chunk_size, "CIRRUS_DOWNLOAD_CHUNK_SIZE");
        if let Ok(v) = std::env::var("CIRRUS_UPLOAD_CHUNK_SIZE") {
            config.upload_chunk_size = v.parse().ok();
        }
        if let Ok(v) = std::env::var("CIRRUS_MAX_TRANSFER_RETRIES") {
            if let Ok(n) = v.parse() {
                config.max_transfer_retries = n;
            }
        }
        if let Ok(v) = std::env::var("CIRRUS_MAX_PARTS_IN_PROGRESS") {
            if let Ok(n) = v.parse() {
                config.max_parts_in_progress = n;
            }
        }
        set_u64(
            &mut config.request_timeout_seconds,
            "CIRRUS_REQUEST_TIMEOUT_SECONDS",
        );
        set_u64(
            &mut config.transfer_timeout_seconds,
            "CIRRUS_TRANSFER_TIMEOUT_SECONDS",
        );
        set_bool(&mut config.use_encryption, "CIRRUS_USE_ENCRYPTION");
        set_string(&mut config.volume_key_id, "CIRRUS_VOLUME_KEY_ID");
        set_string(&mut config.volume_key_file, "CIRRUS_VOLUME_KEY_FILE");
        set_string(&mut config.local_store_path, "CIRRUS_LOCAL_STORE_PATH");
        set_u64(&mut config.max_local_store_size, "CIRRUS_MAX_LOCAL_STORE_SIZE");
        set_u64(
            &mut config.local_store_purge_period,
            "CIRRUS_LOCAL_STORE_PURGE_PERIOD",
        );
        set_bool(
            &mut config.enable_local_store_persistence,
            "CIRRUS_ENABLE_LOCAL_STORE_PERSISTENCE",
        );
        set_bool(
            &mut config.verify_etag_before_reopen,
            "CIRRUS_VERIFY_ETAG_BEFORE_REOPEN",
        );
        set_string(&mut config.stats_file, "CIRRUS_STATS_FILE");
        set_bool(&mut config.verbose_requests, "CIRRUS_VERBOSE_REQUESTS");
        set_string(&mut config.xattr_prefix, "CIRRUS_XATTR_PREFIX");

        config
    }

    /// The upload chunk size actually in effect for this service.
    #[must_use]
    pub fn effective_upload_chunk_size(&self) -> u64 {
        self.upload_chunk_size.unwrap_or(match self.service {
            ServiceKind::Aws | ServiceKind::Fvs => AWS_MIN_PART_SIZE,
            ServiceKind::GoogleStorage => 256 * 1024,
        })
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if self.bucket_name.is_empty() {
            return Err("bucket_name must be set".to_owned());
        }

        if self.download_chunk_size == 0 || self.download_chunk_size % HASH_CHUNK_SIZE != 0 {
            return Err(format!(
                "download_chunk_size must be a non-zero multiple of {HASH_CHUNK_SIZE}"
            ));
        }

        let upload_chunk = self.effective_upload_chunk_size();
        if upload_chunk % HASH_CHUNK_SIZE != 0 {
            return Err(format!(
                "upload_chunk_size must be a multiple of {HASH_CHUNK_SIZE}"
            ));
        }

        // AWS rejects parts below 5 MiB (other than the last part).
        if matches!(self.service, ServiceKind::Aws | ServiceKind::Fvs)
            && upload_chunk < AWS_MIN_PART_SIZE
        {
            return Err(format!(
                "upload_chunk_size must be at least {AWS_MIN_PART_SIZE} for {}",
                self.service.as_str()
            ));
        }

        if self.use_encryption && self.volume_key_id.is_empty() {
            return Err("volume_key_id must be set if encryption is enabled".to_owned());
        }

        if self.max_parts_in_progress == 0 {
            return Err("max_parts_in_progress must be at least 1".to_owned());
        }

        Ok(())
    }
}

fn set_string(field: &mut String, var: &str) {
    if let Ok(v) = std::env::var(var) {
        *field = v;
    }
}

fn set_bool(field: &mut bool, var: &str) {
    if let Ok(v) = std::env::var(var) {
        *field = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

fn set_u64(field: &mut u64, var: &str) {
    if let Ok(v) = std::env::var(var) {
        if let Ok(n) = v.parse() {
            *field = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            bucket_name: "test-bucket".to_owned(),
            ..Config::default()
        }
    }

    #[test]
    fn test_should_create_default_config() {
        let config = Config::default();
        assert_eq!(config.service, ServiceKind::Aws);
        assert_eq!(config.cache_expiry_seconds, 120);
        assert_eq!(config.max_parts_in_progress, 4);
        assert!(!config.use_encryption);
    }

    #[test]
    fn test_should_parse_service_kind() {
        assert_eq!(ServiceKind::parse("aws"), Some(ServiceKind::Aws));
        assert_eq!(
            ServiceKind::parse("google-storage"),
            Some(ServiceKind::GoogleStorage)
        );
        assert_eq!(ServiceKind::parse("fvs"), Some(ServiceKind::Fvs));
        assert_eq!(ServiceKind::parse("azure"), None);
    }

    #[test]
    fn test_should_validate_default_config_with_bucket() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_should_reject_missing_bucket() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn test_should_enforce_aws_part_size_floor() {
        let config = Config {
            upload_chunk_size: Some(256 * 1024),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_should_allow_small_chunks_for_gcs() {
        let config = Config {
            service: ServiceKind::GoogleStorage,
            upload_chunk_size: Some(256 * 1024),
            ..valid_config()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_upload_chunk_size(), 256 * 1024);
    }

    #[test]
    fn test_should_reject_misaligned_chunk_size() {
        let config = Config {
            download_chunk_size: 100 * 1024,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_should_require_volume_key_id_with_encryption() {
        let config = Config {
            use_encryption: true,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_should_use_provider_default_upload_chunk() {
        assert_eq!(
            valid_config().effective_upload_chunk_size(),
            AWS_MIN_PART_SIZE
        );
    }
}
