//! Authorization Engine
//!
//! Runs the OAuth 2.1 authorization-code flow with PKCE for one server at a
//! time and performs refresh-grant exchanges:
//!
//! ```text
//! Idle -> Discovering -> Registering -> AwaitingCallback -> Exchanging -> Complete
//!                 \              \                \               \
//!                  +--------------+----------------+---------------+--> Failed
//! ```
//!
//! Only one attempt may be in flight per process because every attempt binds
//! the same loopback callback port. A second attempt is rejected with
//! [`Error::AuthorizationInProgress`] rather than queued.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use url::Url;

use super::callback::CallbackListener;
use super::discovery::Discovery;
use super::metadata::OAuthConfig;
use super::pkce::{self, PkcePair};
use super::registration::{self, ClientCredentials};
use super::storage::TokenRecord;
use crate::config::OAuthSettings;
use crate::{Error, Result};

/// Phase of an authorization attempt, used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Discovering,
    Registering,
    AwaitingCallback,
    Exchanging,
    Complete,
    Failed,
}

/// OAuth token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Result of a refresh-grant exchange.
///
/// Refresh never raises: callers decide whether a failure means falling back
/// to full re-authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New access token, prior refresh token retained if none was returned
    Refreshed(TokenRecord),
    /// The record has no refresh token
    NoRefreshToken,
    /// The token endpoint rejected the grant or was unreachable
    Failed(String),
}

impl RefreshOutcome {
    /// Convert into a `Result`, mapping every non-success to `RefreshFailed`
    pub fn into_result(self) -> Result<TokenRecord> {
        match self {
            Self::Refreshed(record) => Ok(record),
            Self::NoRefreshToken => Err(Error::RefreshFailed("no refresh token".to_string())),
            Self::Failed(reason) => Err(Error::RefreshFailed(reason)),
        }
    }
}

/// Everything produced by a successful authorization
#[derive(Debug, Clone)]
pub struct AuthorizationGrant {
    /// Discovered OAuth configuration
    pub oauth_config: OAuthConfig,
    /// Client used for the attempt (persist with the registration)
    pub client: ClientCredentials,
    /// Token record to hand to the token store
    pub token: TokenRecord,
}

/// State of one authorize -> callback round trip
#[derive(Debug)]
struct AttemptState {
    state_nonce: String,
    pkce: PkcePair,
    redirect_uri: String,
    started_at: DateTime<Utc>,
}

/// An attempt waiting for the user to visit the authorization URL
pub struct PendingAuthorization {
    authorization_url: String,
    attempt: AttemptState,
    oauth_config: OAuthConfig,
    client: ClientCredentials,
    listener: CallbackListener,
    timeout: Duration,
    http: Client,
    _attempt_guard: Arc<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("authorization_url", &self.authorization_url)
            .field("redirect_uri", &self.attempt.redirect_uri)
            .field("started_at", &self.attempt.started_at)
            .finish_non_exhaustive()
    }
}

impl PendingAuthorization {
    /// URL the user must open in a browser
    #[must_use]
    pub fn authorization_url(&self) -> &str {
        &self.authorization_url
    }

    /// Redirect URI registered for this attempt
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.attempt.redirect_uri
    }

    /// CSRF state nonce sent with the authorization request
    #[must_use]
    pub fn state(&self) -> &str {
        &self.attempt.state_nonce
    }

    /// Client used for this attempt
    #[must_use]
    pub fn client(&self) -> &ClientCredentials {
        &self.client
    }

    /// Wait for the callback and exchange the code for tokens.
    ///
    /// Dropping the returned future (or the pending attempt) cancels the
    /// attempt. The engine accepts a new attempt only after the callback
    /// socket has been closed.
    pub async fn complete(self) -> Result<AuthorizationGrant> {
        let Self {
            attempt,
            oauth_config,
            client,
            listener,
            timeout,
            http,
            _attempt_guard,
            ..
        } = self;

        debug!(phase = ?AttemptPhase::AwaitingCallback, timeout = ?timeout, "Waiting for OAuth callback");
        let code = match listener.wait(timeout).await {
            Ok(code) => code,
            Err(e) => {
                warn!(phase = ?AttemptPhase::Failed, error = %e, "Authorization callback failed");
                return Err(e);
            }
        };

        debug!(phase = ?AttemptPhase::Exchanging, "Exchanging authorization code");
        let token = exchange_code(
            &http,
            &oauth_config.token_endpoint,
            &client,
            &code.code,
            &attempt.redirect_uri,
            &attempt.pkce.code_verifier,
        )
        .await
        .inspect_err(|e| warn!(phase = ?AttemptPhase::Failed, error = %e, "Token exchange failed"))?;

        let elapsed = Utc::now() - attempt.started_at;
        info!(
            phase = ?AttemptPhase::Complete,
            issuer = %oauth_config.issuer,
            elapsed_ms = elapsed.num_milliseconds(),
            "Authorization completed"
        );

        Ok(AuthorizationGrant {
            oauth_config,
            client,
            token,
        })
    }
}

/// OAuth authorization engine
#[derive(Clone)]
pub struct AuthorizationEngine {
    http: Client,
    settings: OAuthSettings,
    attempt_lock: Arc<Mutex<()>>,
}

impl AuthorizationEngine {
    /// Create an engine with its own HTTP client
    pub fn new(settings: OAuthSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.http_timeout())
            .user_agent(concat!("mcp-oauth-bridge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(http, settings))
    }

    /// Create an engine on top of an existing HTTP client
    #[must_use]
    pub fn with_client(http: Client, settings: OAuthSettings) -> Self {
        Self {
            http,
            settings,
            attempt_lock: Arc::new(Mutex::new(())),
        }
    }

    /// HTTP client used for OAuth requests
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Engine settings
    #[must_use]
    pub fn settings(&self) -> &OAuthSettings {
        &self.settings
    }

    /// Discovery client sharing this engine's HTTP client
    #[must_use]
    pub fn discovery(&self) -> Discovery {
        Discovery::new(self.http.clone())
    }

    /// Discover the server's OAuth configuration and start an attempt
    pub async fn start(&self, resource_url: &str) -> Result<PendingAuthorization> {
        debug!(phase = ?AttemptPhase::Discovering, url = %resource_url, "Starting authorization");
        let config = self
            .discovery()
            .resolve(resource_url)
            .await
            .ok_or_else(|| Error::DiscoveryFailed(resource_url.to_string()))?;
        self.start_with_config(config).await
    }

    /// Start an attempt against an already discovered configuration
    pub async fn start_with_config(&self, oauth_config: OAuthConfig) -> Result<PendingAuthorization> {
        // Shared with the callback server task so the lock outlives the socket.
        let guard = Arc::new(
            Arc::clone(&self.attempt_lock)
                .try_lock_owned()
                .map_err(|_| Error::AuthorizationInProgress)?,
        );

        let state_nonce = pkce::generate_state();
        let listener =
            CallbackListener::bind(&self.settings, state_nonce.clone(), Arc::clone(&guard)).await?;
        let redirect_uri = listener.redirect_uri().to_string();

        debug!(phase = ?AttemptPhase::Registering, redirect_uri = %redirect_uri, "Obtaining client");
        let client = registration::obtain_client(
            &self.http,
            &self.settings,
            oauth_config.registration_endpoint.as_deref(),
            &redirect_uri,
        )
        .await?;

        let attempt = AttemptState {
            state_nonce,
            pkce: PkcePair::generate(),
            redirect_uri,
            started_at: Utc::now(),
        };
        let authorization_url = self.authorization_url(&oauth_config, &client, &attempt)?;
        info!(url = %authorization_url, "Authorization URL ready");

        Ok(PendingAuthorization {
            authorization_url,
            attempt,
            oauth_config,
            client,
            listener,
            timeout: self.settings.callback_timeout(),
            http: self.http.clone(),
            _attempt_guard: guard,
        })
    }

    fn authorization_url(
        &self,
        config: &OAuthConfig,
        client: &ClientCredentials,
        attempt: &AttemptState,
    ) -> Result<String> {
        let mut url = Url::parse(&config.authorization_endpoint).map_err(|e| {
            Error::Config(format!(
                "Invalid authorization endpoint {}: {e}",
                config.authorization_endpoint
            ))
        })?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &client.client_id);
            params.append_pair("redirect_uri", &attempt.redirect_uri);
            params.append_pair("code_challenge", &attempt.pkce.code_challenge);
            params.append_pair("code_challenge_method", "S256");
            params.append_pair("state", &attempt.state_nonce);

            let scopes: Vec<&str> = config
                .scopes_supported
                .iter()
                .take(self.settings.max_requested_scopes)
                .map(String::as_str)
                .collect();
            if !scopes.is_empty() {
                params.append_pair("scope", &scopes.join(" "));
            }
        }

        Ok(url.to_string())
    }

    /// Run a full attempt, handing the authorization URL to `present`
    /// (e.g. to print it or open a browser) before waiting
    pub async fn authorize<F>(&self, resource_url: &str, present: F) -> Result<AuthorizationGrant>
    where
        F: FnOnce(&str),
    {
        let pending = self.start(resource_url).await?;
        present(pending.authorization_url());
        pending.complete().await
    }

    /// Exchange a refresh token for a new access token
    pub async fn refresh(
        &self,
        config: &OAuthConfig,
        client: &ClientCredentials,
        record: &TokenRecord,
    ) -> RefreshOutcome {
        let Some(refresh_token) = record.refresh_token.as_deref() else {
            return RefreshOutcome::NoRefreshToken;
        };

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client.client_id.as_str()),
        ];
        if let Some(secret) = client.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = match request_token(&self.http, &config.token_endpoint, &form).await {
            Ok(response) => response,
            Err(reason) => {
                warn!(token_endpoint = %config.token_endpoint, reason = %reason, "Token refresh failed");
                return RefreshOutcome::Failed(reason);
            }
        };

        info!(token_endpoint = %config.token_endpoint, "Token refreshed");
        RefreshOutcome::Refreshed(TokenRecord::from_response(
            response.access_token,
            response.token_type,
            response.refresh_token.or_else(|| record.refresh_token.clone()),
            response.expires_in,
            response.scope.or_else(|| record.scope.clone()),
        ))
    }
}

/// Exchange an authorization code (plus PKCE verifier) for tokens
pub async fn exchange_code(
    http: &Client,
    token_endpoint: &str,
    client: &ClientCredentials,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> Result<TokenRecord> {
    let mut form = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("code_verifier", code_verifier),
        ("client_id", client.client_id.as_str()),
    ];
    if let Some(secret) = client.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }

    let response = request_token(http, token_endpoint, &form)
        .await
        .map_err(Error::TokenExchangeFailed)?;

    Ok(TokenRecord::from_response(
        response.access_token,
        response.token_type,
        response.refresh_token,
        response.expires_in,
        response.scope,
    ))
}

async fn request_token(
    http: &Client,
    token_endpoint: &str,
    form: &[(&str, &str)],
) -> std::result::Result<TokenResponse, String> {
    let response = http
        .post(token_endpoint)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(form)
        .send()
        .await
        .map_err(|e| format!("token request failed: {e}"))?;

    let status = response.status();
    if status != StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("HTTP {status} - {body}"));
    }

    response
        .json()
        .await
        .map_err(|e| format!("invalid token response: {e}"))
}
