//! Sync engine: drains the pending-change ledger into the remote authority.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sehatlink_common::{Error, Result, StoredRecord};
use sehatlink_storage::LocalRecordStore;

use crate::connectivity::ConnectivityMonitor;
use crate::ledger::{PendingChange, PendingChangeLedger};
use crate::remote::{ChangeSubmission, RemoteAuthority};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::scheduler::SyncMode;

const REPORT_CAPACITY: usize = 16;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// When drains run without an explicit request.
    pub mode: SyncMode,
    /// Deadline for the remote to acknowledge one submission.
    pub submit_timeout_ms: u64,
    /// Retries per submission for transient failures within one drain.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_initial_delay_ms: u64,
}

impl SyncConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::OnReconnect,
            submit_timeout_ms: 15_000,
            max_retries: 2,
            retry_initial_delay_ms: 500,
        }
    }
}

/// Summary of one drain pass.
///
/// `succeeded + failed == attempted`. Entries whose payload could not be
/// decoded count as both `failed` and `corrupted`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub corrupted: usize,
    pub duration: Duration,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// What a drain request resulted in.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    /// A pass ran to completion.
    Completed(DrainReport),
    /// Offline at the time of the request; nothing was attempted.
    Offline,
    /// Another drain was in progress; one follow-up pass was scheduled.
    Coalesced,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub draining: bool,
    pub pending: usize,
    pub quarantined: usize,
    pub last_report: Option<DrainReport>,
}

#[derive(Default)]
struct DrainGate {
    running: bool,
    follow_up: bool,
}

/// Resets the gate if a drain is dropped mid-pass.
struct GateRelease<'a> {
    gate: &'a Mutex<DrainGate>,
    armed: bool,
}

impl Drop for GateRelease<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut gate = lock(self.gate);
            gate.running = false;
            gate.follow_up = false;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sync engine for draining pending changes to the remote authority.
///
/// At most one drain pass runs at a time. A drain requested while another
/// is running schedules exactly one follow-up pass, however many requests
/// arrive in the meantime.
pub struct SyncEngine {
    ledger: Arc<PendingChangeLedger>,
    remote: Arc<dyn RemoteAuthority>,
    monitor: ConnectivityMonitor,
    /// Record store whose local-only flags are cleared on acknowledgment.
    store: Option<Arc<LocalRecordStore>>,
    retry_executor: RetryExecutor,
    config: SyncConfig,
    gate: Mutex<DrainGate>,
    last_report: Mutex<Option<DrainReport>>,
    reports: broadcast::Sender<DrainReport>,
}

impl SyncEngine {
    pub fn new(
        ledger: Arc<PendingChangeLedger>,
        remote: Arc<dyn RemoteAuthority>,
        monitor: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Self {
            ledger,
            remote,
            monitor,
            store: None,
            retry_executor: RetryExecutor::new(config.retry_config()),
            config,
            gate: Mutex::new(DrainGate::default()),
            last_report: Mutex::new(None),
            reports,
        }
    }

    /// Clear `is_local_only` on stored records once their change is acknowledged.
    pub fn with_record_store(mut self, store: Arc<LocalRecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn ledger(&self) -> &Arc<PendingChangeLedger> {
        &self.ledger
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Receive a report after every completed pass.
    pub fn subscribe(&self) -> broadcast::Receiver<DrainReport> {
        self.reports.subscribe()
    }

    pub fn is_draining(&self) -> bool {
        lock(&self.gate).running
    }

    pub fn last_report(&self) -> Option<DrainReport> {
        lock(&self.last_report).clone()
    }

    pub async fn status(&self) -> SyncStatus {
        SyncStatus {
            online: self.monitor.is_online(),
            draining: self.is_draining(),
            pending: self.ledger.unsynced_count().await,
            quarantined: self.ledger.corrupt_count().await,
            last_report: self.last_report(),
        }
    }

    /// Submit every unsynced ledger entry to the remote, oldest first.
    ///
    /// Each entry is submitted independently: one failure never stops the
    /// rest of the pass, and a failed entry stays in the ledger for the next
    /// drain. Synced entries are purged once the pass has finished.
    ///
    /// Returns [`DrainOutcome::Offline`] without touching the ledger when
    /// offline, and [`DrainOutcome::Coalesced`] when another drain is
    /// already running.
    pub async fn drain(&self) -> DrainOutcome {
        if !self.monitor.is_online() {
            debug!("Drain skipped while offline");
            return DrainOutcome::Offline;
        }

        {
            let mut gate = lock(&self.gate);
            if gate.running {
                gate.follow_up = true;
                debug!("Drain already running, follow-up scheduled");
                return DrainOutcome::Coalesced;
            }
            gate.running = true;
        }
        let mut release = GateRelease {
            gate: &self.gate,
            armed: true,
        };

        let mut report = self.run_pass().await;
        loop {
            let next = {
                let mut gate = lock(&self.gate);
                let next = gate.follow_up && self.monitor.is_online();
                gate.follow_up = false;
                if !next {
                    gate.running = false;
                }
                next
            };
            if !next {
                break;
            }
            debug!("Running follow-up drain");
            report = self.run_pass().await;
        }
        release.armed = false;

        DrainOutcome::Completed(report)
    }

    /// Run [`SyncEngine::drain`] on a background task.
    pub fn spawn_drain(self: &Arc<Self>) -> JoinHandle<DrainOutcome> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.drain().await })
    }

    async fn run_pass(&self) -> DrainReport {
        let started = Instant::now();
        let snapshot = self.ledger.list_unsynced().await;
        let mut report = DrainReport {
            attempted: snapshot.len(),
            ..DrainReport::default()
        };

        if !snapshot.is_empty() {
            info!(entries = snapshot.len(), remote = self.remote.name(), "Starting drain");
        }

        let mut confirmed: Vec<StoredRecord> = Vec::new();
        for change in &snapshot {
            let record = match change.decode_record() {
                Ok(record) => record,
                Err(e) => {
                    warn!(change = %change.id, error = %e, "Skipping corrupt ledger entry");
                    report.failed += 1;
                    report.corrupted += 1;
                    continue;
                }
            };

            if !self.monitor.is_online() {
                report.failed += 1;
                continue;
            }

            match self.submit(change).await {
                Ok(()) => match self.ledger.mark_synced(change.id).await {
                    Ok(()) => {
                        report.succeeded += 1;
                        confirmed.push(record);
                    }
                    Err(e) => {
                        warn!(
                            change = %change.id,
                            error = %e,
                            "Acknowledged change could not be marked synced"
                        );
                        report.failed += 1;
                    }
                },
                Err(e) => {
                    warn!(change = %change.id, kind = %change.kind, error = %e, "Change submission failed");
                    report.failed += 1;
                }
            }
        }

        if report.succeeded > 0 {
            if let Err(e) = self.ledger.purge_synced().await {
                warn!(error = %e, "Failed to purge synced ledger entries");
            }
        }

        if let Some(store) = &self.store {
            for record in &confirmed {
                if let Err(e) = store.mark_confirmed(record).await {
                    warn!(record = %record.id(), error = %e, "Failed to clear local-only flag");
                }
            }
        }

        report.duration = started.elapsed();
        report.finished_at = Some(Utc::now());

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                corrupted = report.corrupted,
                duration_ms = report.duration.as_millis() as u64,
                "Drain finished"
            );
        }

        *lock(&self.last_report) = Some(report.clone());
        let _ = self.reports.send(report.clone());
        report
    }

    async fn submit(&self, change: &PendingChange) -> Result<()> {
        let submission = ChangeSubmission::from(change);
        let timeout = self.config.submit_timeout();

        self.retry_executor
            .execute(|| {
                let remote = Arc::clone(&self.remote);
                let submission = submission.clone();
                async move {
                    match tokio::time::timeout(timeout, remote.accept_change(&submission)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout(format!(
                            "change {} not acknowledged within {:?}",
                            submission.change_id, timeout
                        ))),
                    }
                }
            })
            .await
    }
}
