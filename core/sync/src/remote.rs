//! Remote authority that accepts pending changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::ledger::PendingChange;
use sehatlink_common::{ChangeId, Error, RecordKind, Result};

/// Header carrying the change id so the remote can deduplicate resubmissions.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// One change as sent to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSubmission {
    pub change_id: ChangeId,
    pub kind: RecordKind,
    pub payload: Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl From<&PendingChange> for ChangeSubmission {
    fn from(change: &PendingChange) -> Self {
        Self {
            change_id: change.id,
            kind: change.kind,
            payload: change.payload.clone(),
            created_at: change.created_at,
        }
    }
}

/// The server-side system of record.
///
/// Implementations must treat a resubmitted change id as already applied:
/// a change can be delivered more than once if its acknowledgment was lost.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Submit one change. `Ok` means the remote acknowledged it.
    ///
    /// # Errors
    /// - `Network` / `Timeout` for transport failures
    /// - `RemoteSubmit` when the remote refuses the change
    async fn accept_change(&self, submission: &ChangeSubmission) -> Result<()>;
}

/// Remote authority reached over HTTP.
///
/// Each change is POSTed as JSON to `{base}/changes/{kind}`.
pub struct HttpRemote {
    http: Client,
    base: Url,
}

impl HttpRemote {
    /// # Errors
    /// - `Config` if `base` is not a valid URL or the client cannot be built
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base)
            .map_err(|e| Error::Config(format!("Invalid remote URL '{}': {}", base, e)))?;
        // Url::join replaces the last segment unless the path ends with '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(concat!("SehatLink/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base })
    }

    /// Endpoint a change of `kind` is posted to.
    pub fn endpoint(&self, kind: RecordKind) -> Result<Url> {
        self.base
            .join(&format!("changes/{}", kind.as_str()))
            .map_err(|e| Error::Config(format!("Invalid endpoint for {}: {}", kind, e)))
    }
}

#[async_trait]
impl RemoteAuthority for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn accept_change(&self, submission: &ChangeSubmission) -> Result<()> {
        let url = self.endpoint(submission.kind)?;

        let response = self
            .http
            .post(url)
            .header(IDEMPOTENCY_HEADER, submission.change_id.to_string())
            .header(header::ACCEPT, "application/json")
            .json(submission)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("change {}: {}", submission.change_id, e))
                } else {
                    Error::Network(format!("Failed to submit change {}: {}", submission.change_id, e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(change = %submission.change_id, %status, "Remote acknowledged change");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Err(Error::Timeout(
                format!("change {}: {}", submission.change_id, status),
            )),
            s if s.is_server_error() => Err(Error::Network(format!(
                "change {}: {} - {}",
                submission.change_id, s, body
            ))),
            s => Err(Error::RemoteSubmit(format!(
                "change {} refused: {} - {}",
                submission.change_id, s, body
            ))),
        }
    }
}

#[derive(Default)]
struct RemoteState {
    accepted: Vec<ChangeSubmission>,
    seen: HashSet<ChangeId>,
    rejected: HashSet<ChangeId>,
    fail_next: usize,
    latency: Duration,
    latest: HashMap<(RecordKind, String), Value>,
}

/// In-process remote authority.
///
/// Applies changes in arrival order, deduplicating by change id. Failures
/// and latency can be injected to exercise drain behavior.
#[derive(Clone, Default)]
pub struct InMemoryRemote {
    state: Arc<Mutex<RemoteState>>,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse a specific change until [`InMemoryRemote::allow`] is called.
    pub fn reject(&self, change_id: ChangeId) {
        self.with_state(|s| {
            s.rejected.insert(change_id);
        });
    }

    pub fn allow(&self, change_id: ChangeId) {
        self.with_state(|s| {
            s.rejected.remove(&change_id);
        });
    }

    /// Fail the next `count` submissions with a network error.
    pub fn fail_next(&self, count: usize) {
        self.with_state(|s| s.fail_next = count);
    }

    /// Delay every submission by `latency` before it is processed.
    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|s| s.latency = latency);
    }

    /// Distinct changes applied, in the order they were applied.
    pub fn accepted(&self) -> Vec<ChangeSubmission> {
        self.with_state(|s| s.accepted.clone())
    }

    /// Total number of `accept_change` calls, including failed and duplicate ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of submissions that were in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Latest payload applied for a record.
    pub fn latest(&self, kind: RecordKind, record_id: &str) -> Option<Value> {
        self.with_state(|s| s.latest.get(&(kind, record_id.to_string())).cloned())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut RemoteState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn apply(&self, submission: &ChangeSubmission) -> Result<()> {
        self.with_state(|s| {
            if s.fail_next > 0 {
                s.fail_next -= 1;
                return Err(Error::Network("connection reset".to_string()));
            }
            if s.rejected.contains(&submission.change_id) {
                return Err(Error::RemoteSubmit(format!(
                    "change {} refused",
                    submission.change_id
                )));
            }
            if !s.seen.insert(submission.change_id) {
                return Ok(());
            }

            if let Some(id) = submission.payload.get("id").and_then(Value::as_str) {
                s.latest
                    .insert((submission.kind, id.to_string()), submission.payload.clone());
            }
            s.accepted.push(submission.clone());
            Ok(())
        })
    }
}

#[async_trait]
impl RemoteAuthority for InMemoryRemote {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn accept_change(&self, submission: &ChangeSubmission) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = self.with_state(|s| s.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = self.apply(submission);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
