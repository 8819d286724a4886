//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, RawQuery, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

use crate::Error;
use crate::approval::ApprovalGate;
use crate::config::{ApprovalPolicy, ServerRegistration, ServerRegistry};
use crate::forwarder::{ForwardRequest, Forwarder, ToolCall};

/// Shared application state
pub struct AppState {
    /// Authenticated forwarder
    pub forwarder: Arc<Forwarder>,
    /// Approval gate (shared with the forwarder)
    pub gate: Arc<ApprovalGate>,
    /// Server registry (shared with the forwarder)
    pub registry: Arc<ServerRegistry>,
}

impl AppState {
    /// Build state around a forwarder, sharing its gate and registry
    #[must_use]
    pub fn new(forwarder: Arc<Forwarder>) -> Self {
        Self {
            gate: Arc::clone(forwarder.gate()),
            registry: Arc::clone(forwarder.registry()),
            forwarder,
        }
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/mcp/{server}", any(proxy_root_handler))
        .route("/mcp/{server}/{*path}", any(proxy_handler))
        .route("/tools/call", post(tool_call_handler))
        .route("/approvals", get(list_approvals_handler))
        .route("/approvals/stats", get(approval_stats_handler))
        .route("/approvals/{id}", get(get_approval_handler))
        .route("/approvals/{id}/approve", post(approve_handler))
        .route("/approvals/{id}/deny", post(deny_handler))
        .route("/config/servers", get(list_servers_handler))
        .route("/config/servers/{name}", get(get_server_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// JSON error body with the status the error maps to
fn error_response(error: &Error) -> Response {
    (
        error.status_code(),
        Json(json!({ "error": { "message": error.to_string() } })),
    )
        .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.gate.stats();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "servers": state.registry.list_servers().len(),
        "pending_approvals": stats.pending,
    }))
}

// ============================================================================
// Pass-through proxy
// ============================================================================

async fn proxy_root_handler(
    State(state): State<Arc<AppState>>,
    Path(server): Path<String>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    proxy(&state, &server, String::new(), method, headers, query, body).await
}

async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Path((server, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    proxy(&state, &server, path, method, headers, query, body).await
}

async fn proxy(
    state: &AppState,
    server: &str,
    path: String,
    method: Method,
    headers: HeaderMap,
    query: Option<String>,
    body: Bytes,
) -> Response {
    let query = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();

    let request = ForwardRequest {
        method,
        path,
        body,
        headers,
        query,
    };

    match state.forwarder.forward(server, &request).await {
        Ok(upstream) => {
            let mut response = Response::new(Body::from(upstream.body));
            *response.status_mut() = upstream.status;
            let headers = response.headers_mut();
            for (name, value) in &upstream.headers {
                if name != header::CONTENT_LENGTH
                    && name != header::TRANSFER_ENCODING
                    && name != header::CONNECTION
                {
                    headers.append(name, value.clone());
                }
            }
            response
        }
        Err(e) => {
            debug!(server = %server, error = %e, "Proxy request failed");
            error_response(&e)
        }
    }
}

// ============================================================================
// Tool calls
// ============================================================================

/// A single call or a batch
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolCallBody {
    Batch { calls: Vec<ToolCall> },
    Single(ToolCall),
}

async fn tool_call_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ToolCallBody>,
) -> impl IntoResponse {
    match body {
        ToolCallBody::Single(call) => Json(state.forwarder.call_tool(&call).await),
        ToolCallBody::Batch { calls } => {
            let results = state.forwarder.call_tools(&calls).await;
            Json(json!({ "results": results }))
        }
    }
}

// ============================================================================
// Approvals
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct DecisionParams {
    actor: Option<String>,
}

async fn list_approvals_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.gate.list_pending())
}

async fn approval_stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.gate.stats())
}

async fn get_approval_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.gate.get(&id) {
        Some(request) => Json(request).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "message": format!("Approval request not found: {id}") } })),
        )
            .into_response(),
    }
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<DecisionParams>,
) -> Response {
    decide(&state, &id, true, params.actor.as_deref())
}

async fn deny_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<DecisionParams>,
) -> Response {
    decide(&state, &id, false, params.actor.as_deref())
}

fn decide(state: &AppState, id: &str, approve: bool, actor: Option<&str>) -> Response {
    let actor = actor.unwrap_or("api");
    if state.gate.decide(id, approve, actor) {
        return Json(json!({ "success": true, "id": id })).into_response();
    }

    let (status, message) = match state.gate.get(id) {
        Some(request) => (
            StatusCode::CONFLICT,
            format!("Approval request already {}", request.status),
        ),
        None => (
            StatusCode::NOT_FOUND,
            format!("Approval request not found: {id}"),
        ),
    };
    (
        status,
        Json(json!({ "success": false, "error": { "message": message } })),
    )
        .into_response()
}

// ============================================================================
// Configuration view
// ============================================================================

/// Public view of a registration (no client secret)
#[derive(Debug, Serialize)]
struct ServerSummary {
    name: String,
    url: String,
    issuer: String,
    approval_policy: ApprovalPolicy,
    tool_approvals: std::collections::HashMap<String, ApprovalPolicy>,
    authenticated: bool,
}

impl ServerSummary {
    fn new(registration: ServerRegistration, authenticated: bool) -> Self {
        Self {
            name: registration.name,
            url: registration.url,
            issuer: registration.oauth_config.issuer,
            approval_policy: registration.approval_policy,
            tool_approvals: registration.tool_approvals,
            authenticated,
        }
    }
}

async fn list_servers_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tokens = state.forwarder.tokens().list();
    let servers: Vec<ServerSummary> = state
        .registry
        .registrations()
        .into_iter()
        .map(|r| {
            let authenticated = tokens.contains_key(&r.name);
            ServerSummary::new(r, authenticated)
        })
        .collect();
    Json(servers)
}

async fn get_server_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.registry.get_server(&name) {
        Some(registration) => {
            let authenticated = state.forwarder.tokens().get(&name).is_some();
            Json(ServerSummary::new(registration, authenticated)).into_response()
        }
        None => error_response(&Error::ServerNotFound(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthSettings;
    use crate::oauth::{AuthorizationEngine, OAuthConfig, TokenCipher, TokenRecord, TokenStore};
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use wiremock::matchers::{header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state(dir: &TempDir, upstream: &str) -> Arc<AppState> {
        let registry = Arc::new(ServerRegistry::open(dir.path().join("servers.json")));
        registry
            .add_server(ServerRegistration::new(
                "demo",
                format!("{upstream}/mcp"),
                OAuthConfig {
                    resource_url: format!("{upstream}/mcp"),
                    issuer: upstream.to_string(),
                    authorization_endpoint: format!("{upstream}/authorize"),
                    token_endpoint: format!("{upstream}/token"),
                    registration_endpoint: None,
                    revocation_endpoint: None,
                    scopes_supported: vec![],
                    response_types_supported: vec![],
                    grant_types_supported: vec![],
                    code_challenge_methods_supported: vec![],
                },
                None,
            ))
            .unwrap();
        let tokens = Arc::new(TokenStore::open(
            dir.path().join("tokens.enc"),
            TokenCipher::from_identity("router@test"),
        ));
        let gate = Arc::new(ApprovalGate::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
        let forwarder = Forwarder::new(
            reqwest::Client::new(),
            registry,
            tokens,
            AuthorizationEngine::with_client(reqwest::Client::new(), OAuthSettings::default()),
            gate,
            Duration::from_secs(300),
        );
        Arc::new(AppState::new(Arc::new(forwarder)))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let dir = TempDir::new().unwrap();
        let app = create_router(state(&dir, "http://127.0.0.1:9"));

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["servers"], 1);
    }

    #[tokio::test]
    async fn proxy_maps_errors_to_status() {
        let dir = TempDir::new().unwrap();
        let app = create_router(state(&dir, "http://127.0.0.1:9"));

        let response = app
            .clone()
            .oneshot(Request::get("/mcp/missing/tools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::post("/mcp/demo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn proxy_passes_path_query_and_body_through() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp/rpc/v1"))
            .and(header_is("authorization", "Bearer AT1"))
            .and(wiremock::matchers::query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("x-upstream", "yes")
                    .set_body_string("accepted"),
            )
            .expect(1)
            .mount(&upstream)
            .await;

        let dir = TempDir::new().unwrap();
        let state = state(&dir, &upstream.uri());
        state
            .forwarder
            .tokens()
            .put(
                "demo",
                TokenRecord::from_response("AT1".into(), None, None, Some(3600), None),
            )
            .unwrap();

        let response = create_router(state)
            .oneshot(
                Request::post("/mcp/demo/rpc/v1?page=2")
                    .header("host", "bridge.local")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()["x-upstream"], "yes");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"accepted");
    }

    #[tokio::test]
    async fn approval_endpoints_decide_once() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir, "http://127.0.0.1:9");
        let app = create_router(Arc::clone(&state));

        let gate = Arc::clone(&state.gate);
        let waiter = tokio::spawn(async move {
            gate.request("demo", "search", json!({}), "Search", None).await
        });

        let id = loop {
            if let Some(request) = state.gate.list_pending().first() {
                break request.id.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        let listed = body_json(
            app.clone()
                .oneshot(Request::get("/approvals").body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(listed[0]["id"], id.as_str());
        assert_eq!(listed[0]["status"], "pending");

        let first = app
            .clone()
            .oneshot(
                Request::post(format!("/approvals/{id}/approve?actor=alice"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert!(waiter.await.unwrap());

        let second = app
            .clone()
            .oneshot(
                Request::post(format!("/approvals/{id}/deny"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let stats = body_json(
            app.clone()
                .oneshot(Request::get("/approvals/stats").body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(stats["approved"], 1);

        let fetched = body_json(
            app.clone()
                .oneshot(Request::get(format!("/approvals/{id}")).body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(fetched["resolved_by"], "alice");

        let missing = app
            .oneshot(
                Request::post("/approvals/nope/approve")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn server_view_hides_credentials() {
        let dir = TempDir::new().unwrap();
        let app = create_router(state(&dir, "http://127.0.0.1:9"));

        let servers = body_json(
            app.clone()
                .oneshot(Request::get("/config/servers").body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(servers[0]["name"], "demo");
        assert_eq!(servers[0]["approval_policy"], "always_ask");
        assert_eq!(servers[0]["authenticated"], false);
        assert!(servers[0].get("client").is_none());

        let missing = app
            .oneshot(Request::get("/config/servers/other").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tool_call_batch_returns_results_in_order() {
        let dir = TempDir::new().unwrap();
        let app = create_router(state(&dir, "http://127.0.0.1:9"));

        let response = app
            .oneshot(
                Request::post("/tools/call")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"calls": [
                            {"server_name": "missing", "payload": {"params": {"name": "a"}}},
                            {"server_name": "other", "payload": {"params": {"name": "b"}}}
                        ]})
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0]["error"]["message"].as_str().unwrap().contains("missing"));
        assert!(results[1]["error"]["message"].as_str().unwrap().contains("other"));
    }
}
