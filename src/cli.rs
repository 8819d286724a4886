//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::ApprovalPolicy;

/// MCP OAuth Bridge - OAuth 2.1 trust broker for MCP servers
#[derive(Parser, Debug)]
#[command(name = "mcp-oauth-bridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to settings file (YAML)
    #[arg(short, long, env = "MCP_OAUTH_BRIDGE_SETTINGS", global = true)]
    pub settings: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MCP_OAUTH_BRIDGE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_OAUTH_BRIDGE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the configuration directory and an empty server registry
    Init,

    /// Discover, register and authorize an OAuth-protected MCP server
    Add {
        /// Unique server name
        name: String,

        /// MCP server URL
        url: String,

        /// Approval policy for the server's tools
        #[arg(long, default_value = "always_ask")]
        policy: ApprovalPolicy,
    },

    /// List registered servers
    List,

    /// Remove a server and its tokens
    Remove {
        /// Server name
        name: String,
    },

    /// Show token state for every registered server
    Status,

    /// Refresh a server's token, re-authorizing if the refresh grant fails
    Refresh {
        /// Server name
        name: String,
    },

    /// Set the approval policy of a server or one of its tools
    Policy {
        /// Server name
        name: String,

        /// always_allow, always_ask or never_allow
        policy: ApprovalPolicy,

        /// Apply to this tool only
        #[arg(long)]
        tool: Option<String>,
    },

    /// Remove tokens that are expired and cannot be refreshed
    Sweep,

    /// Start the proxy server
    Start {
        /// Host to bind to
        #[arg(long, env = "MCP_OAUTH_BRIDGE_HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "MCP_OAUTH_BRIDGE_PORT")]
        port: Option<u16>,
    },
}
