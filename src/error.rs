//! Error types for MCP OAuth Bridge

use std::io;
use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for MCP OAuth Bridge
pub type Result<T> = std::result::Result<T, Error>;

/// MCP OAuth Bridge errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No registration exists for the named server
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// No OAuth metadata could be discovered for a resource
    #[error("OAuth discovery failed for {0}")]
    DiscoveryFailed(String),

    /// Dynamic client registration failed and no fallback client is allowed
    #[error("Client registration failed: {0}")]
    RegistrationFailed(String),

    /// The authorization server (or the user) refused the authorization request
    #[error("Authorization denied: {error}{}", description.as_deref().map(|d| format!(" - {d}")).unwrap_or_default())]
    AuthorizationDenied {
        /// OAuth error code from the callback
        error: String,
        /// Optional human-readable description
        description: Option<String>,
    },

    /// No callback arrived within the allotted time
    #[error("Authorization timed out after {0:?}")]
    AuthorizationTimedOut(Duration),

    /// Another authorization attempt currently owns the callback listener
    #[error("Another authorization attempt is already in progress")]
    AuthorizationInProgress,

    /// The callback `state` did not match the one generated for this attempt
    #[error("OAuth state mismatch - possible CSRF attack")]
    StateMismatch,

    /// Authorization code exchange failed
    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// Refresh grant failed
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// A configured server has no usable token
    #[error("No valid OAuth token for server '{0}'")]
    Unauthenticated(String),

    /// Upstream MCP server rejected a call with a non-auth error
    #[error("Upstream rejected request: HTTP {status} - {body}")]
    UpstreamRejected {
        /// HTTP status returned by the upstream
        status: u16,
        /// Raw response body
        body: String,
    },

    /// A human denied the tool call (or policy forbids it)
    #[error("Tool call {server}.{tool} was denied")]
    ApprovalDenied {
        /// Server name
        server: String,
        /// Tool name
        tool: String,
    },

    /// Nobody decided on the tool call before it expired
    #[error("Approval for {server}.{tool} expired")]
    ApprovalExpired {
        /// Server name
        server: String,
        /// Tool name
        tool: String,
    },

    /// Token or registry persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status used when this error surfaces through the proxy
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ServerNotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthenticated(_) | Self::RefreshFailed(_) => StatusCode::UNAUTHORIZED,
            Self::ApprovalDenied { .. } | Self::ApprovalExpired { .. } => StatusCode::FORBIDDEN,
            Self::AuthorizationInProgress => StatusCode::CONFLICT,
            Self::UpstreamRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Http(_) | Self::DiscoveryFailed(_) => StatusCode::BAD_GATEWAY,
            Self::Json(_) | Self::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error means the tool call must not proceed for policy reasons
    #[must_use]
    pub fn is_approval_failure(&self) -> bool {
        matches!(self, Self::ApprovalDenied { .. } | Self::ApprovalExpired { .. })
    }
}
