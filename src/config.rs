//! Configuration management
//!
//! Two layers live here:
//!
//! - [`Settings`]: runtime knobs (proxy bind address, callback listener,
//!   approval timeouts) loaded with figment from an optional YAML file and
//!   `MCP_OAUTH_BRIDGE_*` environment variables.
//! - [`ServerRegistry`]: the plaintext `servers.json` registration file that
//!   records which MCP servers are known, how to reach their authorization
//!   server, and which approval policy applies. Tokens are never stored here.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::oauth::{ClientCredentials, OAuthConfig};
use crate::{Error, Result};

/// Name of the registration file inside the config directory
pub const REGISTRY_FILE: &str = "servers.json";

/// Name of the encrypted token file inside the config directory
pub const TOKENS_FILE: &str = "tokens.enc";

/// Runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding `servers.json` and `tokens.enc` (supports `~`)
    pub config_dir: String,
    /// Environment files to load before anything else.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Proxy server settings
    pub proxy: ProxySettings,
    /// OAuth client settings
    pub oauth: OAuthSettings,
    /// Approval gate settings
    pub approvals: ApprovalSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: "~/.mcp-oauth-bridge".to_string(),
            env_files: Vec::new(),
            proxy: ProxySettings::default(),
            oauth: OAuthSettings::default(),
            approvals: ApprovalSettings::default(),
        }
    }
}

/// Proxy server bind address
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Timeout for forwarded upstream requests (seconds)
    pub request_timeout_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            request_timeout_secs: 30,
        }
    }
}

impl ProxySettings {
    /// Public URL of the proxy
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Upstream request timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// OAuth client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    /// Host name used in the redirect URI
    pub callback_host: String,
    /// Loopback port of the callback listener (0 = ephemeral, tests only)
    pub callback_port: u16,
    /// Path of the callback endpoint
    pub callback_path: String,
    /// How long to wait for the browser callback (seconds)
    pub callback_timeout_secs: u64,
    /// Timeout for discovery, registration and token requests (seconds)
    pub http_timeout_secs: u64,
    /// `client_name` sent during dynamic registration
    pub client_name: String,
    /// Public client id used when dynamic registration is unavailable
    pub fallback_client_id: String,
    /// Whether the fallback public client may be used at all
    pub allow_fallback_client: bool,
    /// Refresh tokens that expire within this window before using them (seconds)
    pub refresh_window_secs: u64,
    /// Upper bound on the number of discovered scopes requested
    pub max_requested_scopes: usize,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            callback_host: "localhost".to_string(),
            callback_port: 8080,
            callback_path: "/oauth/callback".to_string(),
            callback_timeout_secs: 300,
            http_timeout_secs: 10,
            client_name: "MCP OAuth Bridge".to_string(),
            fallback_client_id: "mcp-oauth-bridge".to_string(),
            allow_fallback_client: true,
            refresh_window_secs: 300,
            max_requested_scopes: 3,
        }
    }
}

impl OAuthSettings {
    /// Bounded wait for the authorization callback
    #[must_use]
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    /// Timeout for outbound OAuth requests
    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Proactive refresh window
    #[must_use]
    pub fn refresh_window(&self) -> Duration {
        Duration::from_secs(self.refresh_window_secs)
    }
}

/// Approval gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    /// Default time a pending approval waits for a decision (seconds)
    pub default_timeout_secs: u64,
    /// How long resolved requests stay visible in stats (seconds)
    pub retention_secs: u64,
    /// Interval of the background expiry sweep (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30 * 60,
            retention_secs: 60 * 60,
            sweep_interval_secs: 30,
        }
    }
}

impl ApprovalSettings {
    /// Default approval timeout
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Retention of resolved approvals
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Background sweep interval
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Settings {
    /// Load settings from an optional YAML file and the environment
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Settings file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("MCP_OAUTH_BRIDGE_").split("__"));

        let settings: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        settings.load_env_files();
        Ok(settings)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            if expanded.exists() {
                match dotenvy::from_path(&expanded) {
                    Ok(()) => info!(path = %expanded.display(), "Loaded env file"),
                    Err(e) => warn!(path = %expanded.display(), error = %e, "Failed to load env file"),
                }
            } else {
                debug!(path = %expanded.display(), "Env file not found (skipped)");
            }
        }
    }

    /// Resolved configuration directory
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        expand_home(&self.config_dir)
    }

    /// Path of the plaintext registration file
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.config_dir().join(REGISTRY_FILE)
    }

    /// Path of the encrypted token file
    #[must_use]
    pub fn tokens_path(&self) -> PathBuf {
        self.config_dir().join(TOKENS_FILE)
    }
}

/// Expand a leading `~` to the user's home directory
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(path)
}

/// Approval policy for tool calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Forward without asking
    AlwaysAllow,
    /// Suspend the call until a human decides
    #[default]
    AlwaysAsk,
    /// Refuse without asking
    NeverAllow,
}

impl fmt::Display for ApprovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AlwaysAllow => "always_allow",
            Self::AlwaysAsk => "always_ask",
            Self::NeverAllow => "never_allow",
        };
        f.write_str(s)
    }
}

impl FromStr for ApprovalPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "always_allow" | "allow" => Ok(Self::AlwaysAllow),
            "always_ask" | "ask" => Ok(Self::AlwaysAsk),
            "never_allow" | "deny" | "never" => Ok(Self::NeverAllow),
            other => Err(Error::Config(format!("Unknown approval policy: {other}"))),
        }
    }
}

/// A registered MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRegistration {
    /// Unique server name
    pub name: String,
    /// MCP server base URL
    pub url: String,
    /// Discovered OAuth configuration
    pub oauth_config: OAuthConfig,
    /// Client identity obtained at registration time
    #[serde(default)]
    pub client: Option<ClientCredentials>,
    /// Server-wide approval policy
    #[serde(default)]
    pub approval_policy: ApprovalPolicy,
    /// Per-tool overrides of the server policy
    #[serde(default)]
    pub tool_approvals: HashMap<String, ApprovalPolicy>,
}

impl ServerRegistration {
    /// Create a registration with the default `always_ask` policy
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        oauth_config: OAuthConfig,
        client: Option<ClientCredentials>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            oauth_config,
            client,
            approval_policy: ApprovalPolicy::default(),
            tool_approvals: HashMap::new(),
        }
    }

    /// Effective policy for a tool: the tool override wins over the server default
    #[must_use]
    pub fn policy_for(&self, tool_name: Option<&str>) -> ApprovalPolicy {
        tool_name
            .and_then(|tool| self.tool_approvals.get(tool).copied())
            .unwrap_or(self.approval_policy)
    }
}

/// File-backed registry of [`ServerRegistration`]s
pub struct ServerRegistry {
    path: PathBuf,
    servers: RwLock<BTreeMap<String, ServerRegistration>>,
}

impl ServerRegistry {
    /// Open the registry at `path`, loading existing registrations.
    ///
    /// A missing file yields an empty registry; a corrupt file is logged and
    /// also treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let servers = Self::load(&path);
        Self {
            path,
            servers: RwLock::new(servers),
        }
    }

    fn load(path: &Path) -> BTreeMap<String, ServerRegistration> {
        if !path.exists() {
            return BTreeMap::new();
        }

        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(servers) => servers,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not parse server registry, using empty configuration");
                    BTreeMap::new()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read server registry");
                BTreeMap::new()
            }
        }
    }

    fn save(&self, servers: &BTreeMap<String, ServerRegistration>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(servers)?;
        fs::write(&self.path, content)
            .map_err(|e| Error::Storage(format!("Failed to write server registry: {e}")))
    }

    /// Whether the registry file has been created (`init` has run)
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write the current registry to disk, creating the file if needed
    pub fn persist(&self) -> Result<()> {
        let servers = self.servers.read();
        self.save(&servers)
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a registration by name
    #[must_use]
    pub fn get_server(&self, name: &str) -> Option<ServerRegistration> {
        self.servers.read().get(name).cloned()
    }

    /// Names of all registered servers
    #[must_use]
    pub fn list_servers(&self) -> Vec<String> {
        self.servers.read().keys().cloned().collect()
    }

    /// All registrations, ordered by name
    #[must_use]
    pub fn registrations(&self) -> Vec<ServerRegistration> {
        self.servers.read().values().cloned().collect()
    }

    /// Apply `change` to a copy of the registry and install it only once it
    /// has been written. Nothing is saved when `change` returns `false`.
    fn update<F>(&self, change: F) -> Result<bool>
    where
        F: FnOnce(&mut BTreeMap<String, ServerRegistration>) -> bool,
    {
        let mut servers = self.servers.write();
        let mut next = servers.clone();
        if !change(&mut next) {
            return Ok(false);
        }
        self.save(&next)?;
        *servers = next;
        Ok(true)
    }

    /// Add or replace a registration
    pub fn add_server(&self, registration: ServerRegistration) -> Result<()> {
        let name = registration.name.clone();
        self.update(|servers| {
            servers.insert(registration.name.clone(), registration);
            true
        })?;
        info!(server = %name, "Saved server registration");
        Ok(())
    }

    /// Remove a registration. Returns `false` if it did not exist.
    pub fn remove_server(&self, name: &str) -> Result<bool> {
        let removed = self.update(|servers| servers.remove(name).is_some())?;
        if removed {
            info!(server = %name, "Removed server registration");
        }
        Ok(removed)
    }

    /// Set the server default policy, or a tool override when `tool` is given.
    /// Returns `false` if the server is unknown.
    pub fn set_approval_policy(
        &self,
        server: &str,
        policy: ApprovalPolicy,
        tool: Option<&str>,
    ) -> Result<bool> {
        self.update(|servers| {
            let Some(registration) = servers.get_mut(server) else {
                return false;
            };
            match tool {
                Some(tool) => {
                    registration.tool_approvals.insert(tool.to_string(), policy);
                }
                None => registration.approval_policy = policy,
            }
            true
        })
    }

    /// Effective approval policy for a server / tool pair
    #[must_use]
    pub fn approval_policy(&self, server: &str, tool: Option<&str>) -> Option<ApprovalPolicy> {
        self.servers
            .read()
            .get(server)
            .map(|registration| registration.policy_for(tool))
    }
}
