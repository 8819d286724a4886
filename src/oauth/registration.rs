//! Dynamic client registration (RFC 7591)

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::OAuthSettings;
use crate::{Error, Result};

/// OAuth client identity used for authorization and refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredentials {
    /// Client identifier
    pub client_id: String,
    /// Client secret, present only for confidential clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl ClientCredentials {
    /// Public client without a secret
    pub fn public(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

/// Obtain client credentials for one authorization attempt.
///
/// Registers dynamically when an endpoint is known. Any registration failure
/// falls back to the configured static public client unless the fallback is
/// disabled, in which case `RegistrationFailed` is returned.
pub async fn obtain_client(
    http: &Client,
    settings: &OAuthSettings,
    registration_endpoint: Option<&str>,
    redirect_uri: &str,
) -> Result<ClientCredentials> {
    let failure = match registration_endpoint {
        Some(endpoint) => match register(http, &settings.client_name, endpoint, redirect_uri).await {
            Ok(client) => return Ok(client),
            Err(e) => e,
        },
        None => "server does not support dynamic client registration".to_string(),
    };

    if settings.allow_fallback_client {
        warn!(
            reason = %failure,
            client_id = %settings.fallback_client_id,
            "Using fallback public client"
        );
        Ok(ClientCredentials::public(settings.fallback_client_id.clone()))
    } else {
        Err(Error::RegistrationFailed(failure))
    }
}

/// POST the fixed registration payload. Errors are returned as plain strings
/// so the caller can decide between fallback and failure.
async fn register(
    http: &Client,
    client_name: &str,
    endpoint: &str,
    redirect_uri: &str,
) -> std::result::Result<ClientCredentials, String> {
    let body = json!({
        "client_name": client_name,
        "redirect_uris": [redirect_uri],
        "grant_types": ["authorization_code"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
        "application_type": "native"
    });

    debug!(endpoint = %endpoint, redirect_uri = %redirect_uri, "Registering OAuth client");

    let response = http
        .post(endpoint)
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("registration request failed: {e}"))?;

    let status = response.status();
    if status != StatusCode::OK && status != StatusCode::CREATED {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("HTTP {status} - {body}"));
    }

    let registered: RegistrationResponse = response
        .json()
        .await
        .map_err(|e| format!("invalid registration response: {e}"))?;

    info!(client_id = %registered.client_id, "Registered OAuth client");
    Ok(ClientCredentials {
        client_id: registered.client_id,
        client_secret: registered.client_secret,
    })
}
