//! MCP OAuth Bridge Library
//!
//! Local OAuth 2.1 trust broker that lets AI-API clients reach
//! OAuth-protected MCP servers without carrying OAuth logic themselves.
//!
//! # Components
//!
//! - **Discovery**: RFC 9728 / RFC 8414 metadata with a `WWW-Authenticate` fallback
//! - **Authorization Engine**: PKCE authorization-code flow, dynamic client
//!   registration, refresh grants
//! - **Token Store**: AES-256-GCM encrypted token file with expiry tracking
//! - **Approval Gate**: suspends tool calls until a human approves or denies
//! - **Forwarder**: injects bearer tokens, refreshing and retrying once on `401`

#![forbid(unsafe_code)]

pub mod approval;
pub mod cli;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod oauth;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
