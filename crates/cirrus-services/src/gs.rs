//! Google Cloud Storage service adapter.
//!
//! Authenticates with OAuth2 bearer tokens. The access token is refreshed
//! from a persisted refresh token: once at construction, once whenever it
//! expires, and once after an attempt that failed authorization (the hook
//! reports `should_retry` exactly once for a 401, so a revoked token does
//! not loop). The refresh token itself can be bootstrapped interactively
//! from a user-pasted authorization code.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cirrus_core::{Config, Error, Result, url_encode};
use cirrus_crypto::{read_private_file, write_private_file};
use cirrus_transport::{
    HttpMethod, Request, RequestContext, RequestHook, TransportFactory, Watchdog, status,
};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::{MultipartCapability, StorageService};

const EP_TOKEN: &str = "https://accounts.google.com/o/oauth2/token";
const OAUTH_SCOPE: &str =
    "https%3a%2f%2fwww.googleapis.com%2fauth%2fdevstorage.full_control";
const CLIENT_ID: &str = "591551582755.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "CQAaXZWfWJKdy_IV7TNZfO1P";
const REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";
const URL_PREFIX: &str = "https://commondatastorage.googleapis.com";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
}

/// Talks to the provider's OAuth2 token endpoint.
pub struct TokenExchange {
    request_context: Arc<RequestContext>,
}

impl std::fmt::Debug for TokenExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenExchange").finish_non_exhaustive()
    }
}

impl TokenExchange {
    /// Build an exchange using its own unsigned requests.
    #[must_use]
    pub fn new(transport_factory: Box<TransportFactory>, watchdog: &Arc<Watchdog>) -> Self {
        Self {
            request_context: Arc::new(RequestContext {
                transport_factory,
                hook: None,
                watchdog: Arc::clone(watchdog),
                max_transfer_retries: 3,
                default_timeout: Duration::from_secs(30),
                verbose: false,
            }),
        }
    }

    /// The URL a user visits to obtain an authorization code.
    #[must_use]
    pub fn new_token_url() -> String {
        format!(
            "https://accounts.google.com/o/oauth2/auth?client_id={CLIENT_ID}&\
             redirect_uri=urn%3aietf%3awg%3aoauth%3a2.0%3aoob&\
             scope={OAUTH_SCOPE}&response_type=code"
        )
    }

    fn post_form(&self, form: String) -> Result<TokenResponse> {
        let mut request = Request::new(Arc::clone(&self.request_context));
        request.init(HttpMethod::Post);
        request.set_full_url(EP_TOKEN);
        request.set_header("Content-Type", "application/x-www-form-urlencoded");
        request.set_input_buffer(Bytes::from(form));
        request.run(None)?;

        if request.response_code() != status::OK {
            return Err(Error::Http(request.response_code()));
        }

        serde_json::from_slice(request.output_buffer())
            .map_err(|e| Error::Invalid(format!("failed to parse token response: {e}")))
    }

    /// Exchange a refresh token for a fresh access token. Returns the
    /// token and its expiry as a unix timestamp.
    ///
    /// # Errors
    ///
    /// Transport failures and unparseable endpoint responses.
    pub fn refresh(&self, refresh_token: &str) -> Result<(String, i64)> {
        let form = format!(
            "client_id={CLIENT_ID}&client_secret={CLIENT_SECRET}&\
             refresh_token={refresh_token}&grant_type=refresh_token"
        );
        let response = self.post_form(form)?;
        let expiry = chrono::Utc::now().timestamp() + response.expires_in;
        Ok((response.access_token, expiry))
    }

    /// Exchange a user-pasted authorization code for a refresh token.
    ///
    /// # Errors
    ///
    /// Transport failures, unparseable responses, and responses without a
    /// refresh token.
    pub fn exchange_auth_code(&self, code: &str) -> Result<String> {
        let form = format!(
            "client_id={CLIENT_ID}&client_secret={CLIENT_SECRET}&\
             code={code}&redirect_uri={REDIRECT_URI}&grant_type=authorization_code"
        );
        let response = self.post_form(form)?;
        response
            .refresh_token
            .ok_or_else(|| Error::Invalid("no refresh token in response".to_owned()))
    }
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: String,
    expiry: i64,
}

struct GsHook {
    exchange: TokenExchange,
    refresh_token: String,
    project_id: String,
    token: Mutex<TokenState>,
}

impl GsHook {
    fn refresh_locked(&self, state: &mut TokenState) -> Result<()> {
        let (access_token, expiry) = self.exchange.refresh(&self.refresh_token)?;
        debug!("refreshed access token");
        state.access_token = access_token;
        state.expiry = expiry;
        Ok(())
    }
}

impl RequestHook for GsHook {
    fn adjust_url(&self, url: &str) -> String {
        format!("{URL_PREFIX}{url}")
    }

    fn pre_run(&self, request: &mut Request, iter: u32) -> Result<()> {
        let authorization = {
            let mut state = self.token.lock();

            if iter > 0 {
                debug!("last request failed authorization, refreshing token");
                self.refresh_locked(&mut state)?;
            } else if chrono::Utc::now().timestamp() >= state.expiry {
                debug!("access token expired, refreshing");
                self.refresh_locked(&mut state)?;
            }

            format!("Bearer {}", state.access_token)
        };

        request.set_header("Authorization", &authorization);
        request.set_header("x-goog-api-version", "2");
        if !self.project_id.is_empty() {
            request.set_header("x-goog-project-id", &self.project_id);
        }

        Ok(())
    }

    fn should_retry(&self, request: &Request, iter: u32) -> bool {
        request.response_code() == status::UNAUTHORIZED && iter == 0
    }
}

/// The Google Cloud Storage provider.
pub struct GsService {
    hook: Arc<GsHook>,
    bucket_url: String,
}

impl std::fmt::Debug for GsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GsService")
            .field("bucket_url", &self.bucket_url)
            .finish_non_exhaustive()
    }
}

impl GsService {
    /// Build from configuration, reading the persisted refresh token and
    /// performing the initial access-token refresh.
    ///
    /// # Errors
    ///
    /// Token file problems and a failed initial refresh.
    pub fn new(
        config: &Config,
        transport_factory: Box<TransportFactory>,
        watchdog: &Arc<Watchdog>,
    ) -> Result<Self> {
        let refresh_token = read_private_file(&config.gs_token_file)
            .map_err(|e| Error::Invalid(e.to_string()))?;

        Self::with_refresh_token(config, refresh_token, transport_factory, watchdog)
    }

    /// Build with the refresh token supplied directly.
    ///
    /// # Errors
    ///
    /// A failed initial refresh.
    pub fn with_refresh_token(
        config: &Config,
        refresh_token: String,
        transport_factory: Box<TransportFactory>,
        watchdog: &Arc<Watchdog>,
    ) -> Result<Self> {
        let hook = GsHook {
            exchange: TokenExchange::new(transport_factory, watchdog),
            refresh_token,
            project_id: config.gs_project_id.clone(),
            token: Mutex::new(TokenState::default()),
        };

        {
            let mut state = hook.token.lock();
            hook.refresh_locked(&mut state)?;
        }

        Ok(Self {
            hook: Arc::new(hook),
            bucket_url: format!("/{}", url_encode(&config.bucket_name)),
        })
    }

    /// Persist a refresh token into a private file.
    ///
    /// # Errors
    ///
    /// File creation and permission failures.
    pub fn write_token_file(path: &str, token: &str) -> Result<()> {
        write_private_file(path, token).map_err(|e| Error::Invalid(e.to_string()))
    }
}

impl StorageService for GsService {
    fn header_prefix(&self) -> &'static str {
        "x-goog-"
    }

    fn header_meta_prefix(&self) -> &'static str {
        "x-goog-meta-"
    }

    fn bucket_url(&self) -> &str {
        &self.bucket_url
    }

    fn is_next_marker_supported(&self) -> bool {
        true
    }

    fn hook(&self) -> Arc<dyn RequestHook> {
        Arc::clone(&self.hook) as Arc<dyn RequestHook>
    }

    fn multipart(&self) -> MultipartCapability {
        MultipartCapability::GcsResumable
    }
}
