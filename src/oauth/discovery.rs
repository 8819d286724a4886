//! OAuth server discovery
//!
//! Resolves an MCP server URL to a usable [`OAuthConfig`]:
//!
//! 1. `GET {origin}/.well-known/oauth-protected-resource` (RFC 9728)
//! 2. otherwise probe the resource and read its `WWW-Authenticate: Bearer`
//!    challenge (`resource_metadata`, `realm` and `scope` parameters)
//! 3. `GET {auth_server}/.well-known/oauth-authorization-server` (RFC 8414),
//!    falling back to the origin-rooted well-known URL once
//!
//! Every failure is absorbed into `None`; callers decide whether a missing
//! configuration aborts what they were doing.

use reqwest::{Client, header::WWW_AUTHENTICATE};
use tracing::{debug, info, warn};

use super::metadata::{
    AUTHORIZATION_SERVER_PATH, AuthorizationServerMetadata, OAuthConfig, PROTECTED_RESOURCE_PATH,
    ProtectedResourceMetadata, base_url,
};

/// Parameters of a `WWW-Authenticate: Bearer` challenge
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BearerChallenge {
    /// `realm`, which the bridge treats as the authorization server URL
    pub realm: Option<String>,
    /// Space separated `scope`, split
    pub scopes: Vec<String>,
    /// RFC 9728 `resource_metadata` URL
    pub resource_metadata: Option<String>,
}

/// Parse a `WWW-Authenticate` header value.
///
/// Only `Bearer` challenges carrying a `realm` or `resource_metadata`
/// parameter are recognised. Anything else yields `None`, never an error.
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let header = header.trim();
    let scheme = header.get(..6)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let challenge = BearerChallenge {
        realm: quoted_param(header, "realm").map(str::to_string),
        scopes: quoted_param(header, "scope")
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default(),
        resource_metadata: quoted_param(header, "resource_metadata").map(str::to_string),
    };

    if challenge.realm.is_none() && challenge.resource_metadata.is_none() {
        return None;
    }
    Some(challenge)
}

/// Extract `name="value"` from a challenge. The parameter name must start
/// at a word boundary so `scope` does not match inside `xscope`.
fn quoted_param<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{name}=\"");
    let mut offset = 0;

    while let Some(pos) = header[offset..].find(&needle) {
        let start = offset + pos;
        let at_boundary = header[..start]
            .chars()
            .next_back()
            .is_none_or(|c| c == ' ' || c == ',' || c == '\t');

        let value_start = start + needle.len();
        if at_boundary {
            let value_end = header[value_start..].find('"')?;
            return Some(&header[value_start..value_start + value_end]);
        }
        offset = value_start;
    }

    None
}

/// Candidate authorization server metadata URLs, most specific first
fn authorization_server_candidates(auth_server: &str) -> Vec<String> {
    let mut candidates = Vec::with_capacity(2);

    let trimmed = auth_server.trim_end_matches('/');
    if trimmed.ends_with(AUTHORIZATION_SERVER_PATH) {
        candidates.push(trimmed.to_string());
    } else {
        candidates.push(format!("{trimmed}{AUTHORIZATION_SERVER_PATH}"));
    }

    if let Ok(origin) = base_url(auth_server) {
        let rooted = format!("{origin}{AUTHORIZATION_SERVER_PATH}");
        if !candidates.contains(&rooted) {
            candidates.push(rooted);
        }
    }

    candidates
}

/// OAuth discovery client
#[derive(Clone)]
pub struct Discovery {
    client: Client,
}

impl Discovery {
    /// Create a discovery client on top of a shared HTTP client
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Complete discovery for a resource URL
    pub async fn resolve(&self, resource_url: &str) -> Option<OAuthConfig> {
        info!(url = %resource_url, "Starting OAuth discovery");

        let resource = self.discover_protected_resource(resource_url).await?;

        let Some(auth_server) = resource.authorization_server() else {
            warn!(url = %resource_url, "No authorization servers listed in resource metadata");
            return None;
        };

        let server = self.discover_authorization_server(auth_server).await?;

        if !server.supports_pkce() {
            warn!(
                issuer = %server.issuer,
                "Authorization server does not advertise S256 PKCE support, proceeding anyway"
            );
        }

        let config = OAuthConfig::from_metadata(resource_url, &resource, server);
        info!(
            authorization_endpoint = %config.authorization_endpoint,
            token_endpoint = %config.token_endpoint,
            registration = config.registration_endpoint.is_some(),
            "OAuth discovery completed"
        );
        Some(config)
    }

    /// Discover protected resource metadata (RFC 9728), falling back to the
    /// resource's `WWW-Authenticate` challenge
    pub async fn discover_protected_resource(
        &self,
        resource_url: &str,
    ) -> Option<ProtectedResourceMetadata> {
        let base = match base_url(resource_url) {
            Ok(base) => base,
            Err(e) => {
                warn!(url = %resource_url, error = %e, "Cannot discover OAuth for invalid URL");
                return None;
            }
        };

        let well_known = format!("{base}{PROTECTED_RESOURCE_PATH}");
        match ProtectedResourceMetadata::fetch(&self.client, &well_known).await {
            Ok(metadata) => return Some(metadata),
            Err(e) => debug!(error = %e, "No protected resource metadata, probing resource"),
        }

        let response = match self.client.get(resource_url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %resource_url, error = %e, "Failed to probe resource");
                return None;
            }
        };

        let Some(header) = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
        else {
            warn!(url = %resource_url, status = %response.status(), "No OAuth metadata found");
            return None;
        };

        let Some(challenge) = parse_bearer_challenge(header) else {
            warn!(url = %resource_url, header = %header, "Unrecognised WWW-Authenticate challenge");
            return None;
        };

        if let Some(ref metadata_url) = challenge.resource_metadata {
            match ProtectedResourceMetadata::fetch(&self.client, metadata_url).await {
                Ok(metadata) => return Some(metadata),
                Err(e) => debug!(error = %e, "resource_metadata URL unusable, falling back to realm"),
            }
        }

        let realm = challenge.realm?;
        debug!(realm = %realm, "Derived authorization server from WWW-Authenticate realm");
        Some(ProtectedResourceMetadata {
            resource: resource_url.to_string(),
            authorization_servers: vec![realm],
            scopes_supported: challenge.scopes,
            bearer_methods_supported: Vec::new(),
        })
    }

    /// Discover authorization server metadata (RFC 8414)
    pub async fn discover_authorization_server(
        &self,
        auth_server: &str,
    ) -> Option<AuthorizationServerMetadata> {
        for url in authorization_server_candidates(auth_server) {
            match AuthorizationServerMetadata::fetch(&self.client, &url).await {
                Ok(metadata) => return Some(metadata),
                Err(e) => debug!(url = %url, error = %e, "Authorization server metadata not found"),
            }
        }

        warn!(auth_server = %auth_server, "No authorization server metadata found");
        None
    }
}
