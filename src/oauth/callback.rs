//! OAuth Callback Listener
//!
//! A minimal loopback HTTP server that receives exactly one authorization
//! callback per attempt. The first request carrying `code`/`state` or
//! `error` resolves the attempt; later requests get a "no longer accepting"
//! page.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
};
use parking_lot::Mutex;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OAuthSettings;
use crate::{Error, Result};

/// OAuth callback query parameters
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State parameter (for CSRF protection)
    pub state: Option<String>,

    /// Error code
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}

/// A validated authorization code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCode {
    /// The code to exchange
    pub code: String,
}

type Outcome = Result<AuthorizationCode>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct CallbackState {
    expected_state: String,
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

/// Loopback listener bound for one authorization attempt
pub struct CallbackListener {
    redirect_uri: String,
    local_addr: SocketAddr,
    rx: oneshot::Receiver<Outcome>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl CallbackListener {
    /// Bind the listener on `127.0.0.1:{callback_port}`.
    ///
    /// Binding happens before client registration so the redirect URI sent
    /// to the authorization server carries the actual port. `hold` is moved
    /// into the server task and dropped only after the socket is closed.
    pub async fn bind<H>(settings: &OAuthSettings, expected_state: String, hold: H) -> Result<Self>
    where
        H: Send + 'static,
    {
        let addr = SocketAddr::from(([127, 0, 0, 1], settings.callback_port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind callback listener on {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let path = if settings.callback_path.starts_with('/') {
            settings.callback_path.clone()
        } else {
            format!("/{}", settings.callback_path)
        };
        let redirect_uri = format!(
            "http://{}:{}{path}",
            settings.callback_host,
            local_addr.port()
        );

        let (tx, rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = Arc::new(CallbackState {
            expected_state,
            tx: Mutex::new(Some(tx)),
        });

        let app = Router::new()
            .route(&path, get(handle_callback))
            .with_state(state);

        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "OAuth callback listener failed");
            }
            // The listener is gone once serve returns.
            drop(hold);
        });

        info!(redirect_uri = %redirect_uri, "OAuth callback listener ready");

        Ok(Self {
            redirect_uri,
            local_addr,
            rx,
            shutdown: Some(shutdown_tx),
            server,
        })
    }

    /// Redirect URI to register and send with the authorization request
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Socket address actually bound
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the callback, bounded by `timeout`.
    ///
    /// The socket is closed by the time this returns, whatever the outcome.
    pub async fn wait(mut self, timeout: Duration) -> Result<AuthorizationCode> {
        let outcome = match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Internal(
                "Callback listener stopped before a callback arrived".to_string(),
            )),
            Err(_) => Err(Error::AuthorizationTimedOut(timeout)),
        };

        self.close().await;
        outcome
    }

    async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.server)
            .await
            .is_err()
        {
            debug!("Callback connections still open, aborting listener");
            self.server.abort();
            let _ = (&mut self.server).await;
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        // Cancelled attempts: the server task closes the socket and then
        // releases `hold`.
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    debug!(
        has_code = params.code.is_some(),
        error = ?params.error,
        "Received OAuth callback"
    );

    let Some(tx) = state.tx.lock().take() else {
        return (
            StatusCode::GONE,
            Html(error_page(
                "already_completed",
                "This authorization attempt is no longer accepting callbacks.",
            )),
        );
    };

    let (outcome, status, page) = evaluate(&state.expected_state, params);
    let _ = tx.send(outcome);
    (status, Html(page))
}

fn evaluate(expected_state: &str, params: CallbackParams) -> (Outcome, StatusCode, String) {
    if let Some(error) = params.error {
        let page = error_page(
            &error,
            params
                .error_description
                .as_deref()
                .unwrap_or("The authorization server refused the request."),
        );
        let outcome = Err(Error::AuthorizationDenied {
            error,
            description: params.error_description,
        });
        return (outcome, StatusCode::BAD_REQUEST, page);
    }

    let received_state = params.state.unwrap_or_default();
    if !state_matches(expected_state, &received_state) {
        warn!(
            security_event = "oauth_state_mismatch",
            "OAuth callback state does not match this attempt"
        );
        return (
            Err(Error::StateMismatch),
            StatusCode::BAD_REQUEST,
            error_page("state_mismatch", "Invalid state parameter."),
        );
    }

    match params.code {
        Some(code) if !code.is_empty() => (
            Ok(AuthorizationCode { code }),
            StatusCode::OK,
            success_page(),
        ),
        _ => (
            Err(Error::AuthorizationDenied {
                error: "missing_code".to_string(),
                description: Some("Authorization code not provided".to_string()),
            }),
            StatusCode::BAD_REQUEST,
            error_page("missing_code", "Authorization code not provided."),
        ),
    }
}

fn state_matches(expected: &str, received: &str) -> bool {
    expected.len() == received.len() && bool::from(expected.as_bytes().ct_eq(received.as_bytes()))
}

fn success_page() -> String {
    r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorization Successful</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
               display: flex; justify-content: center; align-items: center;
               height: 100vh; margin: 0; background: #f4f6fb; color: #1f2933; }
        .card { text-align: center; padding: 2rem 3rem; background: white;
                border-radius: 12px; box-shadow: 0 4px 24px rgba(0,0,0,0.08); }
        .icon { font-size: 3rem; color: #2f9e44; }
    </style>
</head>
<body>
    <div class="card">
        <div class="icon">&#10003;</div>
        <h1>Authorization complete</h1>
        <p>The MCP OAuth Bridge received your authorization. You can close this window.</p>
    </div>
</body>
</html>"#
        .to_string()
}

fn error_page(error: &str, description: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorization Failed</title>
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
               display: flex; justify-content: center; align-items: center;
               height: 100vh; margin: 0; background: #fbf4f4; color: #1f2933; }}
        .card {{ text-align: center; padding: 2rem 3rem; background: white; max-width: 420px;
                border-radius: 12px; box-shadow: 0 4px 24px rgba(0,0,0,0.08); }}
        .icon {{ font-size: 3rem; color: #e03131; }}
        code {{ opacity: 0.7; }}
    </style>
</head>
<body>
    <div class="card">
        <div class="icon">&#10007;</div>
        <h1>Authorization failed</h1>
        <p>{}</p>
        <p><code>{}</code></p>
    </div>
</body>
</html>"#,
        escape_html(description),
        escape_html(error)
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> OAuthSettings {
        OAuthSettings {
            callback_host: "127.0.0.1".to_string(),
            callback_port: 0,
            ..OAuthSettings::default()
        }
    }

    #[test]
    fn callback_params_deserialize() {
        let params: CallbackParams =
            serde_urlencoded::from_str("code=abc123&state=xyz789").unwrap();
        assert_eq!(params.code.as_deref(), Some("abc123"));
        assert_eq!(params.state.as_deref(), Some("xyz789"));
        assert!(params.error.is_none());
    }

    #[test]
    fn error_param_wins_over_code() {
        let params: CallbackParams = serde_urlencoded::from_str(
            "code=abc&state=s&error=access_denied&error_description=nope",
        )
        .unwrap();
        let (outcome, status, _) = evaluate("s", params);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        match outcome {
            Err(Error::AuthorizationDenied { error, description }) => {
                assert_eq!(error, "access_denied");
                assert_eq!(description.as_deref(), Some("nope"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn missing_or_wrong_state_is_mismatch() {
        let params: CallbackParams = serde_urlencoded::from_str("code=abc").unwrap();
        assert!(matches!(evaluate("s", params).0, Err(Error::StateMismatch)));

        let params: CallbackParams = serde_urlencoded::from_str("code=abc&state=t").unwrap();
        assert!(matches!(evaluate("s", params).0, Err(Error::StateMismatch)));
    }

    #[test]
    fn missing_code_is_denied() {
        let params: CallbackParams = serde_urlencoded::from_str("state=s").unwrap();
        match evaluate("s", params).0 {
            Err(Error::AuthorizationDenied { error, .. }) => assert_eq!(error, "missing_code"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn error_page_escapes_markup() {
        let page = error_page("<script>", "a & b");
        assert!(page.contains("&lt;script&gt;"));
        assert!(page.contains("a &amp; b"));
    }

    #[tokio::test]
    async fn accepts_exactly_one_callback() {
        let listener = CallbackListener::bind(&settings(), "st4te".to_string(), ())
            .await
            .unwrap();
        let uri = listener.redirect_uri().to_string();
        assert!(uri.ends_with("/oauth/callback"));

        let http = reqwest::Client::new();
        let first = http
            .get(format!("{uri}?code=xyz&state=st4te"))
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), reqwest::StatusCode::OK);

        let second = http
            .get(format!("{uri}?code=other&state=st4te"))
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), reqwest::StatusCode::GONE);

        let code = listener.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code.code, "xyz");
    }

    #[tokio::test]
    async fn times_out_without_callback() {
        let listener = CallbackListener::bind(&settings(), "s".to_string(), ())
            .await
            .unwrap();
        let err = listener.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::AuthorizationTimedOut(_)));
    }

    #[tokio::test]
    async fn port_and_hold_are_released_when_wait_returns() {
        let (hold_tx, mut hold_rx) = oneshot::channel::<()>();
        let listener = CallbackListener::bind(&settings(), "s".to_string(), hold_tx)
            .await
            .unwrap();
        let addr = listener.local_addr();

        let _ = listener.wait(Duration::from_millis(20)).await;

        assert!(matches!(
            hold_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        TcpListener::bind(addr).await.unwrap();
    }

    #[tokio::test]
    async fn dropping_listener_releases_hold_after_socket() {
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let listener = CallbackListener::bind(&settings(), "s".to_string(), hold_tx)
            .await
            .unwrap();
        let addr = listener.local_addr();
        drop(listener);

        // Sender dropped by the server task once serve has returned.
        assert!(hold_rx.await.is_err());
        TcpListener::bind(addr).await.unwrap();
    }
}
