//! OAuth 2.1 client side of the bridge
//!
//! - metadata discovery (RFC 9728 / RFC 8414) with a `WWW-Authenticate` fallback
//! - dynamic client registration (RFC 7591)
//! - authorization code flow with PKCE (RFC 7636) and a loopback callback
//! - encrypted token storage and refresh

mod callback;
mod client;
mod discovery;
mod metadata;
mod pkce;
mod registration;
mod storage;

pub use callback::{AuthorizationCode, CallbackListener};
pub use client::{
    AttemptPhase, AuthorizationEngine, AuthorizationGrant, PendingAuthorization, RefreshOutcome,
    exchange_code,
};
pub use discovery::{BearerChallenge, Discovery, parse_bearer_challenge};
pub use metadata::{
    AUTHORIZATION_SERVER_PATH, AuthorizationServerMetadata, OAuthConfig, PROTECTED_RESOURCE_PATH,
    ProtectedResourceMetadata, base_url,
};
pub use pkce::{PkcePair, challenge_for, generate_state, verify as verify_pkce};
pub use registration::{ClientCredentials, obtain_client};
pub use storage::{TokenCipher, TokenRecord, TokenStore};
