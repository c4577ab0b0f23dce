//! Connectivity monitoring.
//!
//! The monitor holds the current online/offline state and broadcasts an
//! event only when that state actually changes. Repeated reports of the same
//! state are ignored.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use sehatlink_common::{Error, Result};

const EVENT_CAPACITY: usize = 16;

/// Current network reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    BecameOnline,
    BecameOffline,
}

struct MonitorInner {
    state: watch::Sender<Connectivity>,
    events: broadcast::Sender<ConnectivityEvent>,
}

/// Edge-triggered connectivity monitor. Cheap to clone.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(Connectivity::from_online(online));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner { state, events }),
        }
    }

    /// Create a monitor initialized from a single probe check.
    pub async fn from_probe(probe: &dyn ConnectivityProbe) -> Self {
        Self::new(probe.check().await)
    }

    pub fn is_online(&self) -> bool {
        *self.inner.state.borrow() == Connectivity::Online
    }

    pub fn state(&self) -> Connectivity {
        *self.inner.state.borrow()
    }

    /// Record an observation of the platform's network status.
    ///
    /// # Returns
    /// The event emitted, or `None` if the state did not change.
    pub fn set_online(&self, online: bool) -> Option<ConnectivityEvent> {
        let next = Connectivity::from_online(online);
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if !changed {
            return None;
        }

        let event = match next {
            Connectivity::Online => ConnectivityEvent::BecameOnline,
            Connectivity::Offline => ConnectivityEvent::BecameOffline,
        };
        info!(state = %next, "Connectivity changed");
        // No receivers is fine; the state is still recorded.
        let _ = self.inner.events.send(event);
        Some(event)
    }

    /// Receive every future transition.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.inner.events.subscribe()
    }

    /// Watch the current state.
    pub fn watch(&self) -> watch::Receiver<Connectivity> {
        self.inner.state.subscribe()
    }

    /// Poll `probe` every `interval` and feed the results into this monitor.
    ///
    /// The task runs until aborted.
    pub fn spawn_polling(
        &self,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = probe.check().await;
                debug!(online, "Connectivity probe");
                monitor.set_online(online);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Source of connectivity observations.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Probe with a manually controlled answer.
#[derive(Debug, Default)]
pub struct StaticProbe {
    online: AtomicBool,
}

impl StaticProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn check(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Probe that considers the network up when `url` answers a HEAD request.
///
/// Any HTTP status counts as reachable; only transport failures count as
/// offline.
pub struct HttpProbe {
    http: Client,
    url: Url,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Config(format!("Invalid probe URL '{}': {}", url, e)))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self) -> bool {
        match self.http.head(self.url.clone()).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!(url = %self.url, error = %e, "Probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_state_is_ignored() {
        let monitor = ConnectivityMonitor::new(false);
        let mut events = monitor.subscribe();

        assert_eq!(monitor.set_online(false), None);
        assert_eq!(monitor.set_online(true), Some(ConnectivityEvent::BecameOnline));
        assert_eq!(monitor.set_online(true), None);
        assert_eq!(monitor.set_online(false), Some(ConnectivityEvent::BecameOffline));

        assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::BecameOnline);
        assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::BecameOffline);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_clones_share_state() {
        let monitor = ConnectivityMonitor::new(true);
        let other = monitor.clone();

        other.set_online(false);
        assert!(!monitor.is_online());
        assert_eq!(monitor.state(), Connectivity::Offline);
    }

    #[tokio::test]
    async fn test_watch_sees_transitions() {
        let monitor = ConnectivityMonitor::new(false);
        let mut watcher = monitor.watch();

        monitor.set_online(true);
        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow(), Connectivity::Online);
    }

    #[tokio::test]
    async fn test_from_probe() {
        let probe = StaticProbe::new(true);
        assert!(ConnectivityMonitor::from_probe(&probe).await.is_online());
    }

    #[tokio::test]
    async fn test_polling_follows_probe() {
        let probe = Arc::new(StaticProbe::new(false));
        let monitor = ConnectivityMonitor::new(false);
        let mut events = monitor.subscribe();

        let task = monitor.spawn_polling(probe.clone(), Duration::from_millis(5));
        probe.set(true);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ConnectivityEvent::BecameOnline);
        assert!(monitor.is_online());
        task.abort();
    }

    #[test]
    fn test_http_probe_rejects_bad_url() {
        assert!(matches!(
            HttpProbe::new("::", Duration::from_secs(1)),
            Err(Error::Config(_))
        ));
    }
}
