//! Offline-aware service facade.

use chrono::NaiveTime;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sehatlink_common::{
    Error, NutritionEntry, RecordId, RecordKind, Reminder, ReminderStatus, ReminderType, Result,
    StoredRecord, SymptomCheck,
};
use sehatlink_storage::{EngineChoice, LocalRecordStore, MemoryEngine, StorageEngine};
use sehatlink_sync::{
    ConnectivityEvent, ConnectivityMonitor, ConnectivityProbe, DrainOutcome, DrainReport,
    HttpProbe, HttpRemote, InMemoryRemote, PendingChangeLedger, RemoteAuthority, SyncConfig,
    SyncEngine, SyncScheduler, SyncStatus,
};

use crate::classifier::{KeywordClassifier, SymptomClassifier};
use crate::config::AppConfig;
use crate::session::Session;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The single entry point the UI uses to read and write health records.
///
/// Every write lands in the local record store and the pending-change ledger
/// before it returns. Delivery to the remote happens in the background.
pub struct OfflineService {
    store: Arc<LocalRecordStore>,
    ledger: Arc<PendingChangeLedger>,
    engine: Arc<SyncEngine>,
    monitor: ConnectivityMonitor,
    scheduler: SyncScheduler,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    /// Drains started by `save`, awaited on shutdown.
    background_drains: Mutex<Vec<JoinHandle<DrainOutcome>>>,
    classifier: Arc<dyn SymptomClassifier>,
    session: Mutex<Option<Session>>,
    session_ttl: chrono::Duration,
    memory_only: bool,
}

impl OfflineService {
    /// Open a service from configuration.
    ///
    /// With no remote configured the service stays offline and every change
    /// remains pending.
    ///
    /// # Errors
    /// - `StorageUnavailable` if storage cannot be opened and memory fallback
    ///   is disabled
    /// - `Config` for an invalid configuration
    pub async fn open(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let choice = config.engine_choice()?;
        let (storage, memory_only) = match Self::open_storage(&choice).await {
            Ok(storage) => (storage, !choice.is_persistent()),
            Err(e) if config.fallback_to_memory => {
                warn!(error = %e, "Local storage unavailable, running memory-only");
                let storage: Arc<dyn StorageEngine> = Arc::new(MemoryEngine::new());
                (storage, true)
            }
            Err(e) => return Err(e),
        };

        let remote: Arc<dyn RemoteAuthority>;
        let monitor: ConnectivityMonitor;
        let mut probe: Option<Arc<dyn ConnectivityProbe>> = None;
        match &config.remote_url {
            Some(url) => {
                remote = Arc::new(HttpRemote::new(url, config.sync.submit_timeout())?);
                let probe_url = config.effective_probe_url().unwrap_or(url);
                let http_probe: Arc<dyn ConnectivityProbe> =
                    Arc::new(HttpProbe::new(probe_url, PROBE_TIMEOUT)?);
                monitor = ConnectivityMonitor::from_probe(http_probe.as_ref()).await;
                probe = Some(http_probe);
            }
            None => {
                info!("No remote configured, changes stay pending");
                remote = Arc::new(InMemoryRemote::new());
                monitor = ConnectivityMonitor::new(false);
            }
        }

        let mut service =
            Self::with_parts(storage, remote, monitor.clone(), config.sync.clone()).await?;
        service.memory_only = memory_only;
        service.session_ttl = config.session_ttl();

        if let Some(probe) = probe {
            let interval = Duration::from_secs(config.probe_interval_secs.max(1));
            *lock(&service.poller) = Some(monitor.spawn_polling(probe, interval));
        }

        info!(
            engine = service.store.engine_name(),
            online = monitor.is_online(),
            pending = service.ledger.unsynced_count().await,
            "Offline service opened"
        );
        Ok(service)
    }

    async fn open_storage(choice: &EngineChoice) -> Result<Arc<dyn StorageEngine>> {
        let storage = choice.open()?;
        // Probe the engine so an unusable directory fails here, not on first save.
        storage.list_tables().await?;
        Ok(storage)
    }

    /// Assemble a service from explicit parts and start its scheduler.
    ///
    /// Store and ledger share `storage`.
    pub async fn with_parts(
        storage: Arc<dyn StorageEngine>,
        remote: Arc<dyn RemoteAuthority>,
        monitor: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Result<Self> {
        let store = Arc::new(LocalRecordStore::open(storage.clone()).await?);
        let ledger = Arc::new(PendingChangeLedger::open(storage).await?);
        let mode = config.mode.clone();
        let engine = Arc::new(
            SyncEngine::new(ledger.clone(), remote, monitor.clone(), config)
                .with_record_store(store.clone()),
        );

        let (scheduler, handle) = SyncScheduler::new(engine.clone(), &monitor, mode);
        let scheduler_task = tokio::spawn(handle.run());

        Ok(Self {
            store,
            ledger,
            engine,
            monitor,
            scheduler,
            scheduler_task: Mutex::new(Some(scheduler_task)),
            poller: Mutex::new(None),
            background_drains: Mutex::new(Vec::new()),
            classifier: Arc::new(KeywordClassifier),
            session: Mutex::new(None),
            session_ttl: chrono::Duration::hours(24),
            memory_only: false,
        })
    }

    /// Replace the symptom classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn SymptomClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Whether records only live in memory for this session.
    pub fn is_memory_only(&self) -> bool {
        self.memory_only
    }

    pub fn store(&self) -> &Arc<LocalRecordStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<PendingChangeLedger> {
        &self.ledger
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// Save a record locally and queue it for the remote.
    ///
    /// The record is flagged local-only until the remote acknowledges it.
    /// Returns once the store and the ledger have both been written; when
    /// online a drain is started in the background.
    ///
    /// # Errors
    /// - `SessionExpired` if an expired admin session is attached
    /// - `InvalidInput` if the record fails validation
    /// - `StorageUnavailable` if either write fails
    pub async fn save(&self, record: impl Into<StoredRecord>) -> Result<StoredRecord> {
        self.ensure_session()?;

        let mut record = record.into();
        record.set_local_only(true);
        let kind = record.kind();

        self.store.put(record.clone()).await?;
        let payload = record.to_payload()?;
        if let Err(e) = self.ledger.append(kind, payload).await {
            warn!(kind = %kind, record = %record.id(), error = %e, "Saved locally but could not queue for sync");
            return Err(e);
        }
        debug!(kind = %kind, record = %record.id(), "Record saved");

        if self.monitor.is_online() {
            let drain = self.engine.spawn_drain();
            let mut drains = lock(&self.background_drains);
            drains.retain(|d| !d.is_finished());
            drains.push(drain);
        }
        Ok(record)
    }

    pub async fn get(&self, kind: RecordKind, id: &RecordId) -> Option<StoredRecord> {
        self.store.get(kind, id).await
    }

    pub async fn get_all(&self, kind: RecordKind) -> Vec<StoredRecord> {
        self.store.get_all(kind).await
    }

    pub async fn add_reminder(
        &self,
        title: impl Into<String>,
        time: NaiveTime,
        reminder_type: ReminderType,
    ) -> Result<Reminder> {
        let saved = self.save(Reminder::new(title, time, reminder_type)).await?;
        into_reminder(saved)
    }

    /// Change a reminder's status, recording the new snapshot for sync.
    ///
    /// # Errors
    /// - `NotFound` if no reminder has this id
    pub async fn set_reminder_status(
        &self,
        id: &RecordId,
        status: ReminderStatus,
    ) -> Result<Reminder> {
        let mut reminder = self
            .store
            .get(RecordKind::Reminder, id)
            .await
            .and_then(|r| into_reminder(r).ok())
            .ok_or_else(|| Error::NotFound(format!("Reminder {}", id)))?;

        reminder.status = status;
        into_reminder(self.save(reminder).await?)
    }

    pub async fn reminders(&self, status: Option<ReminderStatus>) -> Vec<Reminder> {
        match status {
            Some(status) => self.store.reminders_with_status(status).await,
            None => self
                .store
                .get_all(RecordKind::Reminder)
                .await
                .into_iter()
                .filter_map(|r| into_reminder(r).ok())
                .collect(),
        }
    }

    pub async fn log_nutrition(&self, food: impl Into<String>) -> Result<NutritionEntry> {
        match self.save(NutritionEntry::new(food)).await? {
            StoredRecord::NutritionEntry(entry) => Ok(entry),
            other => Err(unexpected(other)),
        }
    }

    /// Classify symptoms and save the analysis.
    pub async fn record_symptom_check(&self, symptoms: &str) -> Result<SymptomCheck> {
        let offline = !self.monitor.is_online();
        let result = self.classifier.classify(symptoms, offline).await?;
        match self.save(SymptomCheck::new(symptoms.trim(), result)).await? {
            StoredRecord::SymptomCheck(check) => Ok(check),
            other => Err(unexpected(other)),
        }
    }

    /// Record a platform connectivity observation.
    pub fn set_online(&self, online: bool) -> Option<ConnectivityEvent> {
        self.monitor.set_online(online)
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Drain now and wait for the result.
    ///
    /// Goes through the scheduler; drains directly if its task has stopped.
    pub async fn sync_now(&self) -> DrainOutcome {
        match self.scheduler.request_drain().await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(error = %e, "Scheduler unavailable, draining directly");
                self.engine.drain().await
            }
        }
    }

    /// Number of changes not yet acknowledged by the remote.
    pub async fn pending_sync_count(&self) -> usize {
        self.ledger.unsynced_count().await
    }

    pub async fn status(&self) -> SyncStatus {
        self.engine.status().await
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<DrainReport> {
        self.engine.subscribe()
    }

    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.monitor.subscribe()
    }

    /// Attach an admin session; writes fail once it expires.
    pub fn attach_session(&self, session: Session) {
        *lock(&self.session) = Some(session);
    }

    /// Start and attach a session using the configured lifetime.
    pub fn login(&self, user: impl Into<String>) -> Session {
        let session = Session::new(user, self.session_ttl);
        self.attach_session(session.clone());
        session
    }

    pub fn logout(&self) -> Option<Session> {
        lock(&self.session).take()
    }

    pub fn session(&self) -> Option<Session> {
        lock(&self.session).clone()
    }

    /// Renew the attached session.
    ///
    /// # Errors
    /// - `NotFound` when no session is attached
    pub fn refresh(&self) -> Result<Session> {
        let mut guard = lock(&self.session);
        let session = guard
            .as_mut()
            .ok_or_else(|| Error::NotFound("No session attached".to_string()))?;
        session.refresh_at(chrono::Utc::now());
        Ok(session.clone())
    }

    fn ensure_session(&self) -> Result<()> {
        match lock(&self.session).as_ref() {
            Some(session) => session.ensure_valid_at(chrono::Utc::now()),
            None => Ok(()),
        }
    }

    /// Stop background tasks, letting in-progress drains finish.
    pub async fn shutdown(self) {
        if let Some(poller) = lock(&self.poller).take() {
            poller.abort();
        }

        let drains: Vec<_> = lock(&self.background_drains).drain(..).collect();
        for drain in drains {
            let _ = drain.await;
        }

        self.scheduler.shutdown().await;
        let task = lock(&self.scheduler_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Offline service shut down");
    }
}

fn into_reminder(record: StoredRecord) -> Result<Reminder> {
    match record {
        StoredRecord::Reminder(reminder) => Ok(reminder),
        other => Err(unexpected(other)),
    }
}

fn unexpected(record: StoredRecord) -> Error {
    Error::InvalidInput(format!("Unexpected {} record {}", record.kind(), record.id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sehatlink_common::parse_time_of_day;
    use sehatlink_sync::SyncMode;
    use tempfile::TempDir;

    fn manual() -> SyncConfig {
        SyncConfig {
            mode: SyncMode::Manual,
            max_retries: 0,
            ..SyncConfig::default()
        }
    }

    async fn offline_service() -> (OfflineService, MemoryEngine) {
        let storage = MemoryEngine::new();
        let service = OfflineService::with_parts(
            Arc::new(storage.clone()),
            Arc::new(InMemoryRemote::new()),
            ConnectivityMonitor::new(false),
            manual(),
        )
        .await
        .unwrap();
        (service, storage)
    }

    #[tokio::test]
    async fn test_save_flags_local_and_queues() {
        let (service, _) = offline_service().await;
        let reminder = service
            .add_reminder("Metformin", parse_time_of_day("08:00").unwrap(), ReminderType::Medication)
            .await
            .unwrap();

        assert!(reminder.is_local_only);
        assert_eq!(service.pending_sync_count().await, 1);
        assert_eq!(service.reminders(None).await, vec![reminder]);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_status_appends_new_snapshot() {
        let (service, _) = offline_service().await;
        let reminder = service
            .add_reminder("Walk", parse_time_of_day("18:30").unwrap(), ReminderType::Exercise)
            .await
            .unwrap();

        let done = service
            .set_reminder_status(&reminder.id, ReminderStatus::Done)
            .await
            .unwrap();
        assert_eq!(done.status, ReminderStatus::Done);
        assert_eq!(service.pending_sync_count().await, 2);
        assert_eq!(service.reminders(Some(ReminderStatus::Pending)).await.len(), 0);

        let missing = RecordId::new("nope").unwrap();
        assert!(matches!(
            service.set_reminder_status(&missing, ReminderStatus::Missed).await,
            Err(Error::NotFound(_))
        ));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces() {
        let (service, storage) = offline_service().await;
        storage.set_available(false);

        let err = service.log_nutrition("dal").await.unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
        assert_eq!(service.pending_sync_count().await, 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_offline_symptom_check() {
        let (service, _) = offline_service().await;
        let check = service.record_symptom_check("fever and cough").await.unwrap();

        assert_eq!(check.result.confidence, 55);
        assert!(check.is_local_only);
        assert_eq!(service.get_all(RecordKind::SymptomCheck).await.len(), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_session_blocks_writes() {
        let (service, _) = offline_service().await;
        service.attach_session(Session::started_at(
            "admin",
            chrono::Utc::now() - chrono::Duration::hours(25),
            chrono::Duration::hours(24),
        ));

        assert!(matches!(
            service.log_nutrition("rice").await,
            Err(Error::SessionExpired(_))
        ));

        service.refresh().unwrap();
        assert!(service.log_nutrition("rice").await.is_ok());

        service.logout();
        assert!(matches!(service.refresh(), Err(Error::NotFound(_))));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_long_session_does_not_block_writes() {
        let (service, _) = offline_service().await;
        service.attach_session(Session::new("admin", chrono::Duration::hours(10_000_000_000)));

        assert!(service.log_nutrition("rice").await.is_ok());
        assert_eq!(service.pending_sync_count().await, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_now_goes_through_scheduler() {
        let (service, _) = offline_service().await;
        service.log_nutrition("upma").await.unwrap();
        assert_eq!(service.sync_now().await, DrainOutcome::Offline);

        service.set_online(true);
        let outcome = service.sync_now().await;
        assert!(matches!(outcome, DrainOutcome::Completed(ref r) if r.succeeded == 1));
        assert_eq!(service.pending_sync_count().await, 0);

        // With the scheduler task gone the drain still runs in place.
        service.scheduler.shutdown().await;
        let task = lock(&service.scheduler_task).take();
        task.unwrap().await.unwrap();
        service.log_nutrition("poha").await.unwrap();
        let outcome = service.sync_now().await;
        assert!(matches!(outcome, DrainOutcome::Completed(_) | DrainOutcome::Coalesced));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_without_remote_stays_offline() {
        let temp = TempDir::new().unwrap();
        let config = AppConfig {
            data_dir: temp.path().to_path_buf(),
            ..AppConfig::default()
        };

        let service = OfflineService::open(config.clone()).await.unwrap();
        assert!(!service.is_online());
        assert!(!service.is_memory_only());
        service.log_nutrition("khichdi").await.unwrap();
        service.shutdown().await;

        // Reopen: record and pending change survive
        let service = OfflineService::open(config).await.unwrap();
        assert_eq!(service.get_all(RecordKind::NutritionEntry).await.len(), 1);
        assert_eq!(service.pending_sync_count().await, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_falls_back_to_memory() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let mut config = AppConfig {
            data_dir: blocker,
            ..AppConfig::default()
        };
        let service = OfflineService::open(config.clone()).await.unwrap();
        assert!(service.is_memory_only());
        service.shutdown().await;

        config.fallback_to_memory = false;
        assert!(matches!(
            OfflineService::open(config).await,
            Err(Error::StorageUnavailable(_))
        ));
    }
}
