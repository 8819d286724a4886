//! OAuth Metadata
//!
//! Implements RFC 8414 (OAuth Authorization Server Metadata) and
//! RFC 9728 (OAuth Protected Resource Metadata), plus the merged
//! [`OAuthConfig`] persisted with each server registration.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// Well-known suffix for protected resource metadata (RFC 9728)
pub const PROTECTED_RESOURCE_PATH: &str = "/.well-known/oauth-protected-resource";

/// Well-known suffix for authorization server metadata (RFC 8414)
pub const AUTHORIZATION_SERVER_PATH: &str = "/.well-known/oauth-authorization-server";

/// OAuth Authorization Server Metadata (RFC 8414)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Dynamic client registration endpoint (optional)
    #[serde(default)]
    pub registration_endpoint: Option<String>,

    /// Token revocation endpoint (optional)
    #[serde(default)]
    pub revocation_endpoint: Option<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported response types
    #[serde(default)]
    pub response_types_supported: Vec<String>,

    /// Supported grant types
    #[serde(default)]
    pub grant_types_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// OAuth Protected Resource Metadata (RFC 9728)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Protected resource identifier
    pub resource: String,

    /// Authorization servers that can issue tokens for this resource
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported bearer token methods
    #[serde(default)]
    pub bearer_methods_supported: Vec<String>,
}

/// Everything the bridge needs to authorize against and refresh with a server.
///
/// Built once by discovery and stored in the server registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// The MCP server URL discovery started from
    pub resource_url: String,
    /// Authorization server issuer
    pub issuer: String,
    /// Authorization endpoint URL
    pub authorization_endpoint: String,
    /// Token endpoint URL
    pub token_endpoint: String,
    /// Dynamic client registration endpoint
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    /// Token revocation endpoint
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    /// Scopes, preferring the resource's own list over the authorization server's
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    /// Supported response types
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    /// Supported grant types
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
    /// Supported PKCE methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

impl OAuthConfig {
    /// Merge resource and authorization server metadata
    #[must_use]
    pub fn from_metadata(
        resource_url: &str,
        resource: &ProtectedResourceMetadata,
        server: AuthorizationServerMetadata,
    ) -> Self {
        let scopes_supported = if resource.scopes_supported.is_empty() {
            server.scopes_supported
        } else {
            resource.scopes_supported.clone()
        };

        Self {
            resource_url: resource_url.to_string(),
            issuer: server.issuer,
            authorization_endpoint: server.authorization_endpoint,
            token_endpoint: server.token_endpoint,
            registration_endpoint: server.registration_endpoint,
            revocation_endpoint: server.revocation_endpoint,
            scopes_supported,
            response_types_supported: server.response_types_supported,
            grant_types_supported: server.grant_types_supported,
            code_challenge_methods_supported: server.code_challenge_methods_supported,
        }
    }

    /// Check if PKCE is advertised (S256 method)
    #[must_use]
    pub fn supports_pkce(&self) -> bool {
        self.code_challenge_methods_supported
            .iter()
            .any(|m| m == "S256")
    }
}

/// Deserialize scopes that may be either a string or array
/// Some implementations incorrectly return `"read write"` instead of `["read", "write"]`
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match Option::<StringOrVec>::deserialize(deserializer)? {
        Some(StringOrVec::String(s)) => Ok(s.split_whitespace().map(String::from).collect()),
        Some(StringOrVec::Vec(v)) => Ok(v),
        None => Ok(Vec::new()),
    }
}

impl AuthorizationServerMetadata {
    /// Fetch authorization server metadata from a full well-known URL
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is unreachable, non-200 or returns invalid data.
    pub async fn fetch(client: &Client, url: &str) -> Result<Self> {
        debug!(url = %url, "Fetching OAuth authorization server metadata");
        let metadata: Self = fetch_json(client, url).await?;
        debug!(issuer = %metadata.issuer, "Discovered authorization server");
        Ok(metadata)
    }

    /// Check if PKCE is supported (S256 method)
    #[must_use]
    pub fn supports_pkce(&self) -> bool {
        self.code_challenge_methods_supported
            .iter()
            .any(|m| m == "S256")
    }
}

impl ProtectedResourceMetadata {
    /// Fetch protected resource metadata from a full well-known URL
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is unreachable, non-200 or returns invalid data.
    pub async fn fetch(client: &Client, url: &str) -> Result<Self> {
        debug!(url = %url, "Fetching OAuth protected resource metadata");
        let metadata: Self = fetch_json(client, url).await?;
        debug!(resource = %metadata.resource, "Discovered protected resource");
        Ok(metadata)
    }

    /// Get the first authorization server URL
    pub fn authorization_server(&self) -> Option<&str> {
        self.authorization_servers.first().map(String::as_str)
    }
}

async fn fetch_json<T: DeserializeOwned>(client: &Client, url: &str) -> Result<T> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::DiscoveryFailed(format!("{url}: {e}")))?;

    if response.status() != StatusCode::OK {
        return Err(Error::DiscoveryFailed(format!(
            "{url}: HTTP {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| Error::DiscoveryFailed(format!("{url}: invalid metadata: {e}")))
}

/// Extract the base URL (scheme + host + port) from a full URL
pub fn base_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| Error::Config(format!("Invalid URL {url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Config(format!("URL has no host: {url}")))?;

    let mut base = format!("{}://{host}", parsed.scheme());
    if let Some(port) = parsed.port() {
        use std::fmt::Write;
        let _ = write!(base, ":{port}");
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_metadata(methods: &[&str]) -> AuthorizationServerMetadata {
        AuthorizationServerMetadata {
            issuer: "https://auth.example.com".to_string(),
            authorization_endpoint: "https://auth.example.com/authorize".to_string(),
            token_endpoint: "https://auth.example.com/token".to_string(),
            registration_endpoint: None,
            revocation_endpoint: None,
            scopes_supported: vec!["as:read".to_string()],
            response_types_supported: vec![],
            grant_types_supported: vec![],
            code_challenge_methods_supported: methods.iter().map(ToString::to_string).collect(),
        }
    }

    // =========================================================================
    // deserialize_scopes
    // =========================================================================

    #[test]
    fn deserialize_scopes_array() {
        let json = r#"{"resource": "http://localhost", "scopes_supported": ["read", "write"]}"#;
        let meta: ProtectedResourceMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.scopes_supported, vec!["read", "write"]);
    }

    #[test]
    fn deserialize_scopes_string() {
        let json = r#"{"resource": "http://localhost", "scopes_supported": "read write"}"#;
        let meta: ProtectedResourceMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.scopes_supported, vec!["read", "write"]);
    }

    #[test]
    fn deserialize_scopes_null_and_missing() {
        let json = r#"{"resource": "http://localhost", "scopes_supported": null}"#;
        let meta: ProtectedResourceMetadata = serde_json::from_str(json).unwrap();
        assert!(meta.scopes_supported.is_empty());

        let json = r#"{"resource": "http://localhost"}"#;
        let meta: ProtectedResourceMetadata = serde_json::from_str(json).unwrap();
        assert!(meta.scopes_supported.is_empty());
        assert!(meta.authorization_server().is_none());
    }

    // =========================================================================
    // base_url extraction
    // =========================================================================

    #[test]
    fn base_url_strips_path_and_query() {
        assert_eq!(
            base_url("https://api.example.com/v1/mcp?foo=bar").unwrap(),
            "https://api.example.com"
        );
    }

    #[test]
    fn base_url_preserves_port() {
        assert_eq!(
            base_url("http://127.0.0.1:3000/endpoint").unwrap(),
            "http://127.0.0.1:3000"
        );
    }

    #[test]
    fn base_url_invalid_url_returns_error() {
        assert!(base_url("not a valid url").is_err());
    }

    // =========================================================================
    // OAuthConfig merge
    // =========================================================================

    #[test]
    fn merge_prefers_resource_scopes() {
        let resource = ProtectedResourceMetadata {
            resource: "https://mcp.example.com".to_string(),
            authorization_servers: vec!["https://auth.example.com".to_string()],
            scopes_supported: vec!["mcp:tools".to_string()],
            bearer_methods_supported: vec![],
        };
        let config = OAuthConfig::from_metadata(
            "https://mcp.example.com/mcp",
            &resource,
            server_metadata(&["S256"]),
        );
        assert_eq!(config.resource_url, "https://mcp.example.com/mcp");
        assert_eq!(config.scopes_supported, vec!["mcp:tools"]);
        assert!(config.supports_pkce());
    }

    #[test]
    fn merge_falls_back_to_server_scopes() {
        let resource = ProtectedResourceMetadata {
            resource: "https://mcp.example.com".to_string(),
            authorization_servers: vec![],
            scopes_supported: vec![],
            bearer_methods_supported: vec![],
        };
        let config =
            OAuthConfig::from_metadata("https://mcp.example.com", &resource, server_metadata(&[]));
        assert_eq!(config.scopes_supported, vec!["as:read"]);
        assert!(!config.supports_pkce());
    }

    #[test]
    fn deserialize_auth_server_metadata_minimal() {
        let json = r#"{
            "issuer": "https://auth.example.com",
            "authorization_endpoint": "https://auth.example.com/authorize",
            "token_endpoint": "https://auth.example.com/token"
        }"#;
        let meta: AuthorizationServerMetadata = serde_json::from_str(json).unwrap();
        assert!(meta.registration_endpoint.is_none());
        assert!(meta.scopes_supported.is_empty());
        assert!(!meta.supports_pkce());
    }
}
