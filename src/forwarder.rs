//! Authenticated forwarding to registered MCP servers
//!
//! Every call resolves the server's current token, refreshing it first when
//! it is about to expire, injects it as a bearer header and sends the request.
//! An upstream `401` triggers exactly one refresh and exactly one retry. A
//! second `401` is returned to the caller unchanged.
//!
//! Concurrent refreshes for the same server are coalesced: callers queue on
//! a per-server lock and reuse the token the first one obtained.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderMap, HeaderValue,
};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalGate, ApprovalStatus};
use crate::config::{ApprovalPolicy, ServerRegistration, ServerRegistry, Settings};
use crate::oauth::{AuthorizationEngine, ClientCredentials, TokenCipher, TokenRecord, TokenStore};
use crate::{Error, Result};

/// A request to pass through to an MCP server
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    /// HTTP method
    pub method: Method,
    /// Path relative to the server's base URL
    pub path: String,
    /// Raw body
    pub body: Bytes,
    /// Inbound headers; `Host`, `Content-Length` and `Authorization` are replaced
    pub headers: HeaderMap,
    /// Query parameters
    pub query: Vec<(String, String)>,
}

impl ForwardRequest {
    /// JSON `POST` to the server's base URL
    #[must_use]
    pub fn json(payload: &Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        Self {
            method: Method::POST,
            path: String::new(),
            body: Bytes::from(payload.to_string()),
            headers,
            query: Vec::new(),
        }
    }
}

/// Upstream response, passed through verbatim
#[derive(Debug, Clone)]
pub struct ForwardResponse {
    /// Upstream status
    pub status: StatusCode,
    /// Upstream headers
    pub headers: HeaderMap,
    /// Upstream body
    pub body: Bytes,
}

/// One tool invocation produced by an API adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Registered server to call
    pub server_name: String,
    /// JSON-RPC `tools/call` request
    pub payload: Value,
    /// Force the approval gate regardless of policy
    #[serde(default)]
    pub requires_approval: bool,
}

impl ToolCall {
    /// Tool name from `params.name`, falling back to the JSON-RPC method
    #[must_use]
    pub fn tool_name(&self) -> &str {
        self.payload
            .pointer("/params/name")
            .and_then(Value::as_str)
            .or_else(|| self.payload.get("method").and_then(Value::as_str))
            .unwrap_or("unknown")
    }

    /// Tool arguments from `params.arguments`
    #[must_use]
    pub fn arguments(&self) -> Value {
        self.payload
            .pointer("/params/arguments")
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Forwards requests with bearer tokens, refreshing as needed
pub struct Forwarder {
    http: Client,
    registry: Arc<ServerRegistry>,
    tokens: Arc<TokenStore>,
    engine: AuthorizationEngine,
    gate: Arc<ApprovalGate>,
    refresh_window: Duration,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Forwarder {
    /// Create a forwarder over explicitly owned collaborators
    #[must_use]
    pub fn new(
        http: Client,
        registry: Arc<ServerRegistry>,
        tokens: Arc<TokenStore>,
        engine: AuthorizationEngine,
        gate: Arc<ApprovalGate>,
        refresh_window: Duration,
    ) -> Self {
        Self {
            http,
            registry,
            tokens,
            engine,
            gate,
            refresh_window,
            refresh_locks: DashMap::new(),
        }
    }

    /// Assemble the registry, token store, engine and gate described by `settings`
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.proxy.request_timeout())
            .user_agent(concat!("mcp-oauth-bridge/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let registry = Arc::new(ServerRegistry::open(settings.registry_path()));
        let tokens = Arc::new(TokenStore::open(
            settings.tokens_path(),
            TokenCipher::for_current_user(),
        ));
        let engine = AuthorizationEngine::new(settings.oauth.clone())?;
        let gate = Arc::new(ApprovalGate::new(
            settings.approvals.default_timeout(),
            settings.approvals.retention(),
        ));

        Ok(Self::new(
            http,
            registry,
            tokens,
            engine,
            gate,
            settings.oauth.refresh_window(),
        ))
    }

    /// Authorization engine used for refreshes
    #[must_use]
    pub fn engine(&self) -> &AuthorizationEngine {
        &self.engine
    }

    /// Server registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Token store
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Client to refresh with: the registered one, else the public fallback
    #[must_use]
    pub fn client_for(&self, registration: &ServerRegistration) -> ClientCredentials {
        registration.client.clone().unwrap_or_else(|| {
            ClientCredentials::public(self.engine.settings().fallback_client_id.clone())
        })
    }

    /// Approval gate
    #[must_use]
    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    /// Forward a request to a registered server
    pub async fn forward(&self, server_name: &str, request: &ForwardRequest) -> Result<ForwardResponse> {
        let registration = self
            .registry
            .get_server(server_name)
            .ok_or_else(|| Error::ServerNotFound(server_name.to_string()))?;

        let mut record = self
            .tokens
            .get(server_name)
            .ok_or_else(|| Error::Unauthenticated(server_name.to_string()))?;

        if TokenStore::expiring_soon(&record, self.refresh_window) {
            debug!(server = %server_name, "Token expiring soon, refreshing before use");
            match self.refresh(&registration, &record.access_token).await {
                Ok(refreshed) => record = refreshed,
                Err(e) if record.is_expired() => return Err(e),
                Err(e) => {
                    warn!(server = %server_name, error = %e, "Proactive refresh failed, using current token");
                }
            }
        }

        let response = self.send(&registration, request, &record.access_token).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        info!(server = %server_name, "Upstream rejected token, refreshing once");
        let refreshed = match self.refresh(&registration, &record.access_token).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!(server = %server_name, error = %e, "Refresh after 401 failed");
                return Ok(response);
            }
        };

        let retry = self.send(&registration, request, &refreshed.access_token).await?;
        if retry.status == StatusCode::UNAUTHORIZED {
            warn!(server = %server_name, "Upstream rejected refreshed token, not retrying again");
        }
        Ok(retry)
    }

    /// Refresh the server's token unless another caller already replaced
    /// `stale_access_token` while this one waited for the lock
    async fn refresh(&self, registration: &ServerRegistration, stale_access_token: &str) -> Result<TokenRecord> {
        let name = registration.name.as_str();
        let lock = Arc::clone(
            self.refresh_locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let _guard = lock.lock().await;

        let current = self
            .tokens
            .get(name)
            .ok_or_else(|| Error::Unauthenticated(name.to_string()))?;
        if current.access_token != stale_access_token {
            debug!(server = %name, "Token already refreshed by a concurrent call");
            return Ok(current);
        }

        let client = self.client_for(registration);
        let refreshed = self
            .engine
            .refresh(&registration.oauth_config, &client, &current)
            .await
            .into_result()?;

        self.tokens.put(name, refreshed.clone())?;
        Ok(refreshed)
    }

    async fn send(
        &self,
        registration: &ServerRegistration,
        request: &ForwardRequest,
        access_token: &str,
    ) -> Result<ForwardResponse> {
        let url = join_url(&registration.url, &request.path);

        let mut headers = request.headers.clone();
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        let bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))
            .map_err(|e| Error::Internal(format!("Access token is not a valid header value: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);

        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .headers(headers)
            .body(request.body.clone());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        debug!(server = %registration.name, method = %request.method, url = %url, "Forwarding request");
        let response = builder.send().await?;

        Ok(ForwardResponse {
            status: response.status(),
            headers: response.headers().clone(),
            body: response.bytes().await?,
        })
    }

    /// Execute a tool call, returning `{"result": ...}` or `{"error": {"message": ...}}`
    pub async fn call_tool(&self, call: &ToolCall) -> Value {
        match self.try_call_tool(call).await {
            Ok(result) => json!({ "result": result }),
            Err(e) => {
                if !e.is_approval_failure() {
                    warn!(server = %call.server_name, tool = %call.tool_name(), error = %e, "Tool call failed");
                }
                json!({ "error": { "message": e.to_string() } })
            }
        }
    }

    /// Execute a batch of tool calls concurrently, preserving order
    pub async fn call_tools(&self, calls: &[ToolCall]) -> Vec<Value> {
        join_all(calls.iter().map(|call| self.call_tool(call))).await
    }

    /// Execute a tool call after applying its approval policy
    pub async fn try_call_tool(&self, call: &ToolCall) -> Result<Value> {
        let registration = self
            .registry
            .get_server(&call.server_name)
            .ok_or_else(|| Error::ServerNotFound(call.server_name.clone()))?;
        let tool = call.tool_name().to_string();

        self.authorize_tool(&registration, call, &tool).await?;

        let response = self
            .forward(&call.server_name, &ForwardRequest::json(&call.payload))
            .await?;
        if !response.status.is_success() {
            return Err(Error::UpstreamRejected {
                status: response.status.as_u16(),
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }

        let message = parse_rpc_body(&response)?;
        if let Some(error) = message.get("error") {
            let body = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_string);
            return Err(Error::UpstreamRejected {
                status: response.status.as_u16(),
                body,
            });
        }
        Ok(message.get("result").cloned().unwrap_or(message))
    }

    async fn authorize_tool(&self, registration: &ServerRegistration, call: &ToolCall, tool: &str) -> Result<()> {
        let policy = registration.policy_for(Some(tool));
        let denied = || Error::ApprovalDenied {
            server: registration.name.clone(),
            tool: tool.to_string(),
        };

        match policy {
            ApprovalPolicy::NeverAllow => {
                info!(server = %registration.name, tool = %tool, "Tool call blocked by policy");
                return Err(denied());
            }
            ApprovalPolicy::AlwaysAllow if !call.requires_approval => return Ok(()),
            ApprovalPolicy::AlwaysAllow | ApprovalPolicy::AlwaysAsk => {}
        }

        let description = format!("Call tool '{tool}' on server '{}'", registration.name);
        match self
            .gate
            .request_decision(&registration.name, tool, call.arguments(), &description, None)
            .await
        {
            ApprovalStatus::Approved => Ok(()),
            ApprovalStatus::Expired => Err(Error::ApprovalExpired {
                server: registration.name.clone(),
                tool: tool.to_string(),
            }),
            ApprovalStatus::Denied | ApprovalStatus::Pending => Err(denied()),
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{path}", base.trim_end_matches('/'))
    }
}

/// Decode a JSON-RPC response, accepting plain JSON or an SSE stream whose
/// last `data:` event carries the message
fn parse_rpc_body(response: &ForwardResponse) -> Result<Value> {
    let is_sse = response
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    if !is_sse {
        return Ok(serde_json::from_slice(&response.body)?);
    }

    let text = String::from_utf8_lossy(&response.body);
    let data = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty())
        .next_back()
        .ok_or_else(|| Error::Internal("Event stream carried no data".to_string()))?;
    Ok(serde_json::from_str(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthSettings;
    use crate::oauth::OAuthConfig;
    use chrono::{TimeDelta, Utc};
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        _dir: TempDir,
        forwarder: Forwarder,
    }

    fn fixture(server: &MockServer, policy: ApprovalPolicy) -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(ServerRegistry::open(dir.path().join("servers.json")));
        let tokens = Arc::new(TokenStore::open(
            dir.path().join("tokens.enc"),
            TokenCipher::from_identity("test@host"),
        ));

        let mut registration = ServerRegistration::new(
            "demo",
            format!("{}/mcp", server.uri()),
            OAuthConfig {
                resource_url: format!("{}/mcp", server.uri()),
                issuer: server.uri(),
                authorization_endpoint: format!("{}/authorize", server.uri()),
                token_endpoint: format!("{}/token", server.uri()),
                registration_endpoint: None,
                revocation_endpoint: None,
                scopes_supported: vec![],
                response_types_supported: vec![],
                grant_types_supported: vec![],
                code_challenge_methods_supported: vec!["S256".to_string()],
            },
            Some(ClientCredentials::public("abc123")),
        );
        registration.approval_policy = policy;
        registry.add_server(registration).unwrap();

        let forwarder = Forwarder::new(
            Client::new(),
            registry,
            tokens,
            AuthorizationEngine::with_client(Client::new(), OAuthSettings::default()),
            Arc::new(ApprovalGate::new(
                Duration::from_millis(100),
                Duration::from_secs(60),
            )),
            Duration::from_secs(300),
        );
        Fixture {
            _dir: dir,
            forwarder,
        }
    }

    fn token(access: &str, expires_in: u64) -> TokenRecord {
        TokenRecord::from_response(
            access.to_string(),
            None,
            Some("RT1".to_string()),
            Some(expires_in),
            None,
        )
    }

    fn get(path: &str) -> ForwardRequest {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("proxy.local"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer client-secret"));
        ForwardRequest {
            method: Method::GET,
            path: path.to_string(),
            body: Bytes::new(),
            headers,
            query: vec![("cursor".to_string(), "2".to_string())],
        }
    }

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("http://h/mcp/", "/tools"), "http://h/mcp/tools");
        assert_eq!(join_url("http://h/mcp", ""), "http://h/mcp");
        assert_eq!(join_url("http://h/mcp", "a/b"), "http://h/mcp/a/b");
    }

    #[test]
    fn tool_call_extracts_name_and_arguments() {
        let call = ToolCall {
            server_name: "s".into(),
            payload: json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                            "params": {"name": "search", "arguments": {"q": "rust"}}}),
            requires_approval: false,
        };
        assert_eq!(call.tool_name(), "search");
        assert_eq!(call.arguments(), json!({"q": "rust"}));
    }

    #[test]
    fn sse_body_uses_last_data_event() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        let response = ForwardResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from("event: message\ndata: {\"result\": 1}\n\ndata: {\"result\": 2}\n\n"),
        };
        assert_eq!(parse_rpc_body(&response).unwrap(), json!({"result": 2}));
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let server = MockServer::start().await;
        let f = fixture(&server, ApprovalPolicy::AlwaysAllow);
        let err = f.forwarder.forward("nope", &get("/")).await.unwrap_err();
        assert!(matches!(err, Error::ServerNotFound(_)));
    }

    #[tokio::test]
    async fn missing_token_is_unauthenticated() {
        let server = MockServer::start().await;
        let f = fixture(&server, ApprovalPolicy::AlwaysAllow);
        let err = f.forwarder.forward("demo", &get("/")).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn injects_bearer_and_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mcp/tools"))
            .and(header("authorization", "Bearer AT1"))
            .respond_with(ResponseTemplate::new(418).set_body_string("teapot"))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(&server, ApprovalPolicy::AlwaysAllow);
        f.forwarder.tokens().put("demo", token("AT1", 3600)).unwrap();

        let response = f.forwarder.forward("demo", &get("/tools")).await.unwrap();
        assert_eq!(response.status, StatusCode::IM_A_TEAPOT);
        assert_eq!(&response.body[..], b"teapot");
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_before_use() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "AT2", "expires_in": 3600})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer AT2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(&server, ApprovalPolicy::AlwaysAllow);
        f.forwarder.tokens().put("demo", token("AT1", 30)).unwrap();

        let response = f.forwarder.forward("demo", &get("")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let stored = f.forwarder.tokens().get("demo").unwrap();
        assert_eq!(stored.access_token, "AT2");
        assert_eq!(stored.refresh_token.as_deref(), Some("RT1"));
    }

    #[tokio::test]
    async fn registration_without_client_refreshes_with_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("client_id=mcp-oauth-bridge"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "AT2", "expires_in": 3600})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer AT2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(&server, ApprovalPolicy::AlwaysAllow);
        let mut registration = f.forwarder.registry().get_server("demo").unwrap();
        assert_eq!(f.forwarder.client_for(&registration).client_id, "abc123");

        registration.client = None;
        assert_eq!(f.forwarder.client_for(&registration).client_id, "mcp-oauth-bridge");
        f.forwarder.registry().add_server(registration).unwrap();
        f.forwarder.tokens().put("demo", token("AT1", 30)).unwrap();

        let response = f.forwarder.forward("demo", &get("")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn concurrent_refreshes_are_coalesced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "AT2", "expires_in": 3600}))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer AT2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(4)
            .mount(&server)
            .await;

        let f = fixture(&server, ApprovalPolicy::AlwaysAllow);
        let mut stale = token("AT1", 60);
        stale.expires_at = Some(Utc::now() - TimeDelta::seconds(1));
        f.forwarder.tokens().put("demo", stale).unwrap();

        let request = get("");
        let results = join_all((0..4).map(|_| f.forwarder.forward("demo", &request))).await;
        for result in results {
            assert_eq!(result.unwrap().status, StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn failed_refresh_keeps_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let f = fixture(&server, ApprovalPolicy::AlwaysAllow);
        let mut stale = token("AT1", 60);
        stale.expires_at = Some(Utc::now() - TimeDelta::seconds(1));
        f.forwarder.tokens().put("demo", stale).unwrap();

        let err = f.forwarder.forward("demo", &get("")).await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)));
        assert_eq!(f.forwarder.tokens().get("demo").unwrap().access_token, "AT1");
    }

    #[tokio::test]
    async fn never_allow_blocks_without_asking() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let f = fixture(&server, ApprovalPolicy::NeverAllow);
        f.forwarder.tokens().put("demo", token("AT1", 3600)).unwrap();

        let call = ToolCall {
            server_name: "demo".into(),
            payload: json!({"method": "tools/call", "params": {"name": "delete_repo"}}),
            requires_approval: false,
        };
        let result = f.forwarder.call_tool(&call).await;
        let message = result["error"]["message"].as_str().unwrap();
        assert!(message.contains("demo.delete_repo"));
        assert_eq!(f.forwarder.gate().stats().total, 0);
    }

    #[tokio::test]
    async fn allowed_tool_returns_rpc_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("authorization", "Bearer AT1"))
            .and(body_string_contains("\"search\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": {"content": [{"type": "text", "text": "found"}]}
            })))
            .mount(&server)
            .await;

        let f = fixture(&server, ApprovalPolicy::AlwaysAllow);
        f.forwarder.tokens().put("demo", token("AT1", 3600)).unwrap();

        let call = ToolCall {
            server_name: "demo".into(),
            payload: json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                            "params": {"name": "search", "arguments": {}}}),
            requires_approval: false,
        };
        let results = f.forwarder.call_tools(&[call.clone(), call]).await;
        assert_eq!(results.len(), 2);
        for result in results {
            assert_eq!(result["result"]["content"][0]["text"], "found");
        }
    }

    #[tokio::test]
    async fn unanswered_approval_expires_call() {
        let server = MockServer::start().await;
        let f = fixture(&server, ApprovalPolicy::AlwaysAsk);
        f.forwarder.tokens().put("demo", token("AT1", 3600)).unwrap();

        let call = ToolCall {
            server_name: "demo".into(),
            payload: json!({"method": "tools/call", "params": {"name": "search"}}),
            requires_approval: false,
        };
        let err = f.forwarder.try_call_tool(&call).await.unwrap_err();
        assert!(matches!(err, Error::ApprovalExpired { .. }));
    }
}
