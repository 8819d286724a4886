//! Human approval gate for tool calls
//!
//! [`ApprovalGate::request`] registers a pending decision and suspends the
//! caller until one of:
//!
//! - [`ApprovalGate::decide`] resolves it (approve or deny)
//! - its timeout elapses, which marks it `expired` and resolves `false`
//!
//! Every request transitions out of `pending` exactly once. All transitions
//! happen under one lock after re-checking the current status, so a racing
//! sweep and `decide` cannot both apply. Waiters are woken through a
//! `oneshot` channel, never by polling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle state of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    /// Whether the request has been resolved
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A tool call waiting for (or resolved by) a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique request id
    pub id: String,
    /// Target server
    pub server_name: String,
    /// Tool being invoked
    pub tool_name: String,
    /// Tool arguments, shown to the approver
    pub arguments: Value,
    /// Human readable summary
    pub description: String,
    /// When the request was registered
    pub created_at: DateTime<Utc>,
    /// When an undecided request expires
    pub expires_at: DateTime<Utc>,
    /// Current status
    pub status: ApprovalStatus,
    /// Who resolved the request (`"timeout"` for expiry)
    #[serde(default)]
    pub resolved_by: Option<String>,
    /// When the request left `pending`
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && now >= self.expires_at
    }
}

/// Counts of requests by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApprovalStats {
    pub pending: usize,
    pub approved: usize,
    pub denied: usize,
    pub expired: usize,
    pub total: usize,
}

/// Receives every request when it is created and again when it resolves.
///
/// Observer errors are logged and otherwise ignored.
pub trait ApprovalObserver: Send + Sync {
    /// Called with a snapshot of the request
    fn on_update(&self, request: &ApprovalRequest) -> anyhow::Result<()>;
}

impl<F> ApprovalObserver for F
where
    F: Fn(&ApprovalRequest) -> anyhow::Result<()> + Send + Sync,
{
    fn on_update(&self, request: &ApprovalRequest) -> anyhow::Result<()> {
        self(request)
    }
}

struct Entry {
    request: ApprovalRequest,
    waiter: Option<oneshot::Sender<ApprovalStatus>>,
}

impl Entry {
    /// Apply a terminal transition if still pending. Returns the new snapshot.
    fn resolve(&mut self, status: ApprovalStatus, actor: &str, now: DateTime<Utc>) -> Option<ApprovalRequest> {
        if self.request.status.is_terminal() {
            return None;
        }
        self.request.status = status;
        self.request.resolved_by = Some(actor.to_string());
        self.request.resolved_at = Some(now);
        if let Some(waiter) = self.waiter.take() {
            // The caller may have given up already.
            let _ = waiter.send(status);
        }
        Some(self.request.clone())
    }
}

/// Concurrent approval registry
pub struct ApprovalGate {
    entries: Mutex<HashMap<String, Entry>>,
    observers: RwLock<Vec<Arc<dyn ApprovalObserver>>>,
    default_timeout: Duration,
    retention: Duration,
}

impl ApprovalGate {
    /// Create a gate. `retention` bounds how long resolved requests stay visible.
    #[must_use]
    pub fn new(default_timeout: Duration, retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            default_timeout,
            retention,
        }
    }

    /// Timeout used when a request does not specify one
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register an observer
    pub fn add_observer<O>(&self, observer: O)
    where
        O: ApprovalObserver + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    /// Ask for approval and wait. Returns `true` only when approved.
    pub async fn request(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Value,
        description: &str,
        timeout: Option<Duration>,
    ) -> bool {
        self.request_decision(server_name, tool_name, arguments, description, timeout)
            .await
            == ApprovalStatus::Approved
    }

    /// Ask for approval and wait for the terminal status
    pub async fn request_decision(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Value,
        description: &str,
        timeout: Option<Duration>,
    ) -> ApprovalStatus {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let created_at = Utc::now();
        let expires_at = TimeDelta::from_std(timeout)
            .ok()
            .and_then(|t| created_at.checked_add_signed(t))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            server_name: server_name.to_string(),
            tool_name: tool_name.to_string(),
            arguments,
            description: description.to_string(),
            created_at,
            expires_at,
            status: ApprovalStatus::Pending,
            resolved_by: None,
            resolved_at: None,
        };
        let id = request.id.clone();

        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(
            id.clone(),
            Entry {
                request: request.clone(),
                waiter: Some(tx),
            },
        );

        info!(
            request_id = %id,
            server = %server_name,
            tool = %tool_name,
            timeout = ?timeout,
            "Approval requested"
        );
        self.notify(&request);

        let status = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(status)) => status,
            // Waiter dropped without a decision or timer fired: settle under the lock.
            Ok(Err(_)) | Err(_) => self.expire_if_pending(&id),
        };

        debug!(request_id = %id, status = %status, "Approval resolved");
        status
    }

    fn expire_if_pending(&self, id: &str) -> ApprovalStatus {
        let (status, resolved) = {
            let mut entries = self.entries.lock();
            match entries.get_mut(id) {
                Some(entry) => {
                    let resolved = entry.resolve(ApprovalStatus::Expired, "timeout", Utc::now());
                    (entry.request.status, resolved)
                }
                None => (ApprovalStatus::Expired, None),
            }
        };

        if let Some(request) = resolved {
            info!(request_id = %id, "Approval expired");
            self.notify(&request);
        }
        status
    }

    /// Resolve a pending request. Returns `false` if the id is unknown or
    /// already terminal, including requests whose expiry has passed.
    pub fn decide(&self, id: &str, approve: bool, actor: &str) -> bool {
        let now = Utc::now();
        let (applied, resolved) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(id) else {
                return false;
            };

            if entry.request.is_past_expiry(now) {
                (false, entry.resolve(ApprovalStatus::Expired, "timeout", now))
            } else {
                let status = if approve {
                    ApprovalStatus::Approved
                } else {
                    ApprovalStatus::Denied
                };
                let resolved = entry.resolve(status, actor, now);
                (resolved.is_some(), resolved)
            }
        };

        if let Some(request) = resolved {
            info!(
                request_id = %id,
                status = %request.status,
                actor = %actor,
                "Approval decided"
            );
            self.notify(&request);
        }
        applied
    }

    /// Approve a pending request
    pub fn approve(&self, id: &str, actor: &str) -> bool {
        self.decide(id, true, actor)
    }

    /// Deny a pending request
    pub fn deny(&self, id: &str, actor: &str) -> bool {
        self.decide(id, false, actor)
    }

    /// Snapshot of one request
    pub fn get(&self, id: &str) -> Option<ApprovalRequest> {
        self.entries.lock().get(id).map(|e| e.request.clone())
    }

    /// Pending requests, oldest first. Expires overdue requests first.
    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        self.sweep_expired();
        let mut pending: Vec<_> = self
            .entries
            .lock()
            .values()
            .filter(|e| e.request.status == ApprovalStatus::Pending)
            .map(|e| e.request.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// Counts by status. Expires overdue requests first.
    pub fn stats(&self) -> ApprovalStats {
        self.sweep_expired();
        let entries = self.entries.lock();
        let mut stats = ApprovalStats {
            total: entries.len(),
            ..ApprovalStats::default()
        };
        for entry in entries.values() {
            match entry.request.status {
                ApprovalStatus::Pending => stats.pending += 1,
                ApprovalStatus::Approved => stats.approved += 1,
                ApprovalStatus::Denied => stats.denied += 1,
                ApprovalStatus::Expired => stats.expired += 1,
            }
        }
        stats
    }

    /// Expire overdue pending requests and drop resolved ones older than the
    /// retention period. Returns the number of requests expired.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let retention = TimeDelta::from_std(self.retention).unwrap_or(TimeDelta::MAX);

        let expired: Vec<ApprovalRequest> = {
            let mut entries = self.entries.lock();
            let expired: Vec<ApprovalRequest> = entries
                .values_mut()
                .filter(|e| e.request.is_past_expiry(now))
                .filter_map(|e| e.resolve(ApprovalStatus::Expired, "timeout", now))
                .collect();

            entries.retain(|_, e| {
                e.request
                    .resolved_at
                    .is_none_or(|at| now.signed_duration_since(at) <= retention)
            });
            expired
        };

        for request in &expired {
            debug!(request_id = %request.id, "Swept expired approval");
            self.notify(request);
        }
        expired.len()
    }

    fn notify(&self, request: &ApprovalRequest) {
        let observers = self.observers.read().clone();
        for observer in observers {
            if let Err(e) = observer.on_update(request) {
                warn!(request_id = %request.id, error = %e, "Approval observer failed");
            }
        }
    }
}
