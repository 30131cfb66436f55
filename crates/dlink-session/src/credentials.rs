//! Credential exchange: client-credential grant and refresh-token grant.
//!
//! The exchange produces a [`TokenState`]: access token, refresh token and
//! the instant after which the access token is no longer trusted. It runs in
//! one of two modes:
//!
//! - **in-band**: `public/auth` is sent over the open WebSocket and the
//!   response arrives as an ordinary frame;
//! - **out-of-band**: a form-encoded HTTP POST is made before the socket is
//!   used, through the [`FormPoster`] boundary.
//!
//! Refresh is always in-band.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

use dlink_core::logging::redact;
use dlink_core::prelude::*;

use super::protocol::{JsonRpcRequest, RequestKind, RpcResponse};

/// Safety margin subtracted from the server-reported `expires_in`.
pub const DEFAULT_EXPIRY_MARGIN: Duration = Duration::from_secs(240);

/// Fixed lifetime used for test-environment tokens.
pub const DEFAULT_TESTNET_LIFETIME: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Credentials and tokens
// ---------------------------------------------------------------------------

/// API key pair used for the `client_credentials` grant.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Either half missing. Not an error by itself: the server rejects the
    /// exchange later.
    pub fn is_incomplete(&self) -> bool {
        self.client_id.is_empty() || self.client_secret.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .finish()
    }
}

/// Result fields of a successful `public/auth`.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds, as reported by the server.
    pub expires_in: u64,
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Parse the `result` object of an auth response.
///
/// # Errors
///
/// [`Error::AuthFailed`] if `access_token`, `refresh_token` or `expires_in`
/// is missing or has the wrong type.
pub fn parse_token_result(result: &Value) -> Result<TokenSet> {
    let field = |name: &str| {
        result
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::auth_failed(format!("response lacks result.{name}")))
    };

    let access_token = field("access_token")?;
    let refresh_token = field("refresh_token")?;
    let expires_in = result
        .get("expires_in")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::auth_failed("response lacks result.expires_in"))?;
    let scope = result
        .get("scope")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(TokenSet {
        access_token,
        refresh_token,
        expires_in,
        scope,
    })
}

/// Tokens plus the instant the access token stops being trusted.
///
/// Replaced as a whole on every exchange so no reader ever sees a new access
/// token next to an old expiry.
#[derive(Debug, Clone)]
pub struct TokenState {
    pub tokens: TokenSet,
    pub expiry: Instant,
}

impl TokenState {
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expiry.saturating_duration_since(now)
    }
}

/// How long a freshly granted token is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifetimePolicy {
    pub margin: Duration,
    pub testnet_lifetime: Duration,
}

impl Default for LifetimePolicy {
    fn default() -> Self {
        Self {
            margin: DEFAULT_EXPIRY_MARGIN,
            testnet_lifetime: DEFAULT_TESTNET_LIFETIME,
        }
    }
}

impl LifetimePolicy {
    /// Testnet tokens get the fixed lifetime; others `expires_in - margin`.
    ///
    /// A token that does not outlive the margin is trusted for half of
    /// `expires_in`, so the refresh still lands before the real expiry.
    pub fn lifetime(&self, tokens: &TokenSet, testnet: bool) -> Duration {
        if testnet {
            return self.testnet_lifetime;
        }
        let expires_in = Duration::from_secs(tokens.expires_in);
        if expires_in > self.margin {
            expires_in - self.margin
        } else {
            expires_in / 2
        }
    }
}

// ---------------------------------------------------------------------------
// Exchanger
// ---------------------------------------------------------------------------

/// Where the initial grant is performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// `public/auth` over the WebSocket.
    InBand,
    /// Form POST to `token_url` before the socket is used.
    OutOfBand { token_url: String },
}

/// Builds grant requests and turns their responses into [`TokenState`].
#[derive(Debug, Clone)]
pub struct CredentialExchanger {
    credentials: Credentials,
    mode: AuthMode,
    lifetime: LifetimePolicy,
}

impl CredentialExchanger {
    pub fn new(credentials: Credentials, mode: AuthMode, lifetime: LifetimePolicy) -> Self {
        Self {
            credentials,
            mode,
            lifetime,
        }
    }

    pub fn mode(&self) -> &AuthMode {
        &self.mode
    }

    /// In-band `client_credentials` request.
    pub fn auth_request(&self) -> JsonRpcRequest {
        JsonRpcRequest::for_kind(
            RequestKind::Auth,
            json!({
                "grant_type": "client_credentials",
                "client_id": self.credentials.client_id,
                "client_secret": self.credentials.client_secret,
            }),
        )
    }

    /// In-band `refresh_token` request.
    pub fn refresh_request(&self, refresh_token: &str) -> JsonRpcRequest {
        JsonRpcRequest::for_kind(
            RequestKind::Refresh,
            json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }),
        )
    }

    /// Turn an auth/refresh response into a new token state.
    ///
    /// # Errors
    ///
    /// [`Error::AuthFailed`] for a JSON-RPC error or missing result fields.
    pub fn complete(&self, response: RpcResponse, now: Instant) -> Result<TokenState> {
        let testnet = response.testnet;
        let result = response.into_result().map_err(|e| match e {
            Error::Rpc { code, message } => {
                Error::auth_failed(format!("server rejected grant ({code}): {message}"))
            }
            other => Error::auth_failed(other.to_string()),
        })?;
        self.token_state(&result, testnet, now)
    }

    /// Perform the initial grant over HTTP.
    ///
    /// # Errors
    ///
    /// [`Error::AuthFailed`] if the call fails or the body lacks the expected
    /// fields. Only valid in [`AuthMode::OutOfBand`].
    pub async fn authenticate_out_of_band<P: FormPoster>(
        &self,
        poster: &P,
        now: impl FnOnce() -> Instant,
    ) -> Result<TokenState> {
        let AuthMode::OutOfBand { token_url } = &self.mode else {
            return Err(Error::auth_failed("out-of-band grant requested in in-band mode"));
        };

        let mut fields = BTreeMap::new();
        fields.insert("grant_type".to_string(), "client_credentials".to_string());
        fields.insert("client_id".to_string(), self.credentials.client_id.clone());
        fields.insert(
            "client_secret".to_string(),
            self.credentials.client_secret.clone(),
        );

        debug!("Requesting token from {}", token_url);
        let body = poster
            .post_form(token_url, &fields)
            .await
            .map_err(|e| Error::auth_failed(format!("token request failed: {e}")))?;

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| Error::auth_failed(format!("token response is not JSON: {e}")))?;

        if let Some(error) = value.get("error") {
            return Err(Error::auth_failed(format!("server rejected grant: {error}")));
        }

        let result = value
            .get("result")
            .ok_or_else(|| Error::auth_failed("token response lacks result"))?;
        let testnet = value
            .get("testnet")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        self.token_state(result, testnet, now())
    }

    fn token_state(&self, result: &Value, testnet: bool, now: Instant) -> Result<TokenState> {
        let tokens = parse_token_result(result)?;
        let lifetime = self.lifetime.lifetime(&tokens, testnet);
        Ok(TokenState {
            tokens,
            expiry: now + lifetime,
        })
    }
}

// ---------------------------------------------------------------------------
// REST boundary
// ---------------------------------------------------------------------------

/// One-shot form POST used for the out-of-band grant.
#[trait_variant::make(FormPoster: Send)]
pub trait LocalFormPoster {
    /// POST `fields` form-encoded to `url` and return the raw response body.
    async fn post_form(&self, url: &str, fields: &BTreeMap<String, String>) -> Result<String>;
}

/// [`FormPoster`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpFormPoster {
    client: reqwest::Client,
}

impl HttpFormPoster {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl FormPoster for HttpFormPoster {
    async fn post_form(&self, url: &str, fields: &BTreeMap<String, String>) -> Result<String> {
        let response = self
            .client
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .form(fields)
            .send()
            .await
            .map_err(|e| Error::http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::http(format!("reading body: {e}")))?;

        // Deribit reports grant failures as JSON bodies with a 4xx status; the
        // body is more useful to the caller than the status line.
        if !status.is_success() && body.is_empty() {
            return Err(Error::http(format!("status {status}")));
        }
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
