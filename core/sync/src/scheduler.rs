//! Drain scheduling: on reconnect, on a timer, or on request.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use sehatlink_common::{Error, Result};

use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::engine::{DrainOutcome, SyncEngine};

/// When drains run without an explicit request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SyncMode {
    /// Only on request.
    Manual,
    /// Whenever connectivity comes back.
    #[default]
    OnReconnect,
    /// Every `interval_secs` while online.
    Periodic { interval_secs: u64 },
    /// On reconnect and on a timer.
    Hybrid { interval_secs: u64 },
}

impl SyncMode {
    pub fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval_secs } | SyncMode::Hybrid { interval_secs } => {
                Some(Duration::from_secs((*interval_secs).max(1)))
            }
            _ => None,
        }
    }

    pub fn drains_on_reconnect(&self) -> bool {
        matches!(self, SyncMode::OnReconnect | SyncMode::Hybrid { .. })
    }
}

/// Requests accepted by the scheduler task.
#[derive(Debug)]
pub enum SyncRequest {
    Drain,
    Shutdown,
}

type Envelope = (SyncRequest, Option<oneshot::Sender<DrainOutcome>>);

/// Client side of the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: SyncMode,
    request_tx: mpsc::Sender<Envelope>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs it.
    ///
    /// Connectivity events are subscribed to here, so transitions that
    /// happen before the handle starts running are not lost.
    pub fn new(
        engine: Arc<SyncEngine>,
        monitor: &ConnectivityMonitor,
        mode: SyncMode,
    ) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(32);

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle {
            engine,
            mode,
            request_rx,
            events: monitor.subscribe(),
        };
        (scheduler, handle)
    }

    pub fn mode(&self) -> &SyncMode {
        &self.mode
    }

    /// Request a drain and wait for its outcome.
    ///
    /// # Errors
    /// - `InvalidInput` if the scheduler task is not running
    pub async fn request_drain(&self) -> Result<DrainOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send((SyncRequest::Drain, Some(reply_tx)))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        reply_rx
            .await
            .map_err(|_| Error::InvalidInput("Scheduler stopped before replying".to_string()))
    }

    /// Stop the scheduler task. Drains already started run to completion.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send((SyncRequest::Shutdown, None)).await;
    }
}

/// The scheduler's background task.
pub struct SyncSchedulerHandle {
    engine: Arc<SyncEngine>,
    mode: SyncMode,
    request_rx: mpsc::Receiver<Envelope>,
    events: broadcast::Receiver<ConnectivityEvent>,
}

impl SyncSchedulerHandle {
    /// Run until shut down. Spawn this on a tokio task.
    ///
    /// Drains are started on their own tasks; the engine coalesces any that
    /// overlap.
    pub async fn run(mut self) {
        let mut periodic = self.mode.interval().map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        // The first tick of an interval completes immediately.
        if let Some(ticker) = periodic.as_mut() {
            ticker.tick().await;
        }

        info!(mode = ?self.mode, "Sync scheduler started");

        // Already online at start: no reconnect edge will arrive for a backlog
        // left by an earlier session.
        if self.mode.drains_on_reconnect() && self.engine.monitor().is_online() {
            info!("Online at start, draining pending changes");
            self.engine.spawn_drain();
        }

        loop {
            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some((SyncRequest::Drain, reply)) => {
                        let engine = Arc::clone(&self.engine);
                        tokio::spawn(async move {
                            let outcome = engine.drain().await;
                            if let Some(reply) = reply {
                                let _ = reply.send(outcome);
                            }
                        });
                    }
                    Some((SyncRequest::Shutdown, _)) | None => break,
                },

                event = self.events.recv() => match event {
                    Ok(ConnectivityEvent::BecameOnline) if self.mode.drains_on_reconnect() => {
                        info!("Back online, draining pending changes");
                        self.engine.spawn_drain();
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed connectivity events");
                        if self.mode.drains_on_reconnect() && self.engine.monitor().is_online() {
                            self.engine.spawn_drain();
                        }
                    }
                    Err(RecvError::Closed) => break,
                },

                _ = wait_for_periodic(&mut periodic) => {
                    if self.engine.monitor().is_online() {
                        debug!("Periodic drain");
                        self.engine.spawn_drain();
                    }
                }
            }
        }

        info!("Sync scheduler stopped");
    }
}

async fn wait_for_periodic(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
