//! Pending-change ledger: the append-only log of unconfirmed mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use sehatlink_common::{now_millis, ChangeId, Error, RecordKind, Result, StoredRecord};
use sehatlink_storage::StorageEngine;

/// Table holding the ledger.
pub const LEDGER_TABLE: &str = "offline_data";

/// A mutation waiting for remote acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Unique, monotonically increasing id.
    pub id: ChangeId,
    /// Record kind this change affects.
    #[serde(rename = "type")]
    pub kind: RecordKind,
    /// Full record snapshot at the time of the change.
    #[serde(rename = "data")]
    pub payload: Value,
    /// When the change was appended.
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Set only after the remote acknowledged the change.
    pub synced: bool,
}

impl PendingChange {
    /// Decode the payload as a record of the declared kind.
    ///
    /// # Errors
    /// - `LedgerCorruption` if the payload does not match its kind
    pub fn decode_record(&self) -> Result<StoredRecord> {
        StoredRecord::from_payload(self.kind, self.payload.clone()).map_err(|e| {
            Error::LedgerCorruption(format!(
                "change {} ({}) has a malformed payload: {}",
                self.id, self.kind, e
            ))
        })
    }
}

struct LedgerState {
    entries: BTreeMap<ChangeId, PendingChange>,
    /// Rows that failed to parse when the table was loaded.
    quarantined: Vec<Value>,
    next_id: ChangeId,
    last_created_at: Option<DateTime<Utc>>,
}

impl LedgerState {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut rows = Vec::with_capacity(self.entries.len() + self.quarantined.len());
        for entry in self.entries.values() {
            rows.push(serde_json::to_value(entry)?);
        }
        rows.extend(self.quarantined.iter().cloned());
        Ok(serde_json::to_vec(&rows)?)
    }
}

/// Ordered, append-only record of mutations awaiting confirmation.
///
/// The ledger is independent of the record tables: it holds its own copy of
/// each record snapshot, and that copy is what gets sent to the remote.
pub struct PendingChangeLedger {
    engine: Arc<dyn StorageEngine>,
    state: Mutex<LedgerState>,
}

impl PendingChangeLedger {
    /// Open the ledger, loading existing entries from the engine.
    ///
    /// Rows that cannot be parsed are logged and quarantined: they are kept on
    /// disk verbatim but never listed or submitted.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the engine cannot be read or the table is
    ///   not a JSON array
    pub async fn open(engine: Arc<dyn StorageEngine>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut quarantined = Vec::new();
        let mut max_id: Option<u64> = None;

        if let Some(bytes) = engine.read_table(LEDGER_TABLE).await? {
            let rows: Vec<Value> = serde_json::from_slice(&bytes).map_err(|e| {
                Error::StorageUnavailable(format!("ledger unreadable: {}", e))
            })?;

            for row in rows {
                // Never reuse an id, even one belonging to a quarantined row.
                if let Some(id) = row.get("id").and_then(Value::as_u64) {
                    max_id = Some(max_id.map_or(id, |m| m.max(id)));
                }
                match serde_json::from_value::<PendingChange>(row.clone()) {
                    Ok(change) => {
                        entries.insert(change.id, change);
                    }
                    Err(e) => {
                        warn!(error = %e, "Quarantining unreadable ledger entry");
                        quarantined.push(row);
                    }
                }
            }
        }

        let last_created_at = entries.values().map(|c| c.created_at).max();
        debug!(
            entries = entries.len(),
            quarantined = quarantined.len(),
            "Loaded pending-change ledger"
        );

        Ok(Self {
            engine,
            state: Mutex::new(LedgerState {
                entries,
                quarantined,
                next_id: ChangeId::new(max_id.map_or(1, |m| m + 1)),
                last_created_at,
            }),
        })
    }

    /// Append a change with `synced = false` and a fresh id.
    ///
    /// `created_at` never goes backwards, even if the wall clock does.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the ledger cannot be written; the ledger is
    ///   unchanged in that case
    pub async fn append(&self, kind: RecordKind, payload: Value) -> Result<PendingChange> {
        let mut state = self.state.lock().await;

        let now = now_millis();
        let created_at = match state.last_created_at {
            Some(last) if last > now => last,
            _ => now,
        };
        let change = PendingChange {
            id: state.next_id,
            kind,
            payload,
            created_at,
            synced: false,
        };

        state.entries.insert(change.id, change.clone());
        if let Err(e) = self.persist(&state).await {
            state.entries.remove(&change.id);
            return Err(e);
        }

        state.next_id = change.id.next();
        state.last_created_at = Some(created_at);
        debug!(change = %change.id, kind = %kind, "Appended pending change");
        Ok(change)
    }

    /// All unsynced entries, ordered by `created_at` ascending.
    ///
    /// The returned vector is a snapshot; entries appended afterwards are
    /// not part of it.
    pub async fn list_unsynced(&self) -> Vec<PendingChange> {
        let state = self.state.lock().await;
        let mut unsynced: Vec<PendingChange> = state
            .entries
            .values()
            .filter(|c| !c.synced)
            .cloned()
            .collect();
        unsynced.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        unsynced
    }

    /// Unsynced entries of one kind, in the same order as [`Self::list_unsynced`].
    pub async fn list_unsynced_of(&self, kind: RecordKind) -> Vec<PendingChange> {
        let mut unsynced = self.list_unsynced().await;
        unsynced.retain(|c| c.kind == kind);
        unsynced
    }

    /// Mark an entry as acknowledged by the remote.
    ///
    /// Marking an unknown or already-synced id is a no-op.
    pub async fn mark_synced(&self, id: ChangeId) -> Result<()> {
        let mut state = self.state.lock().await;

        match state.entries.get_mut(&id) {
            Some(change) if !change.synced => change.synced = true,
            _ => return Ok(()),
        }

        if let Err(e) = self.persist(&state).await {
            if let Some(change) = state.entries.get_mut(&id) {
                change.synced = false;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Delete every synced entry.
    ///
    /// Must only run after the current drain batch has finished its
    /// `mark_synced` calls.
    ///
    /// # Returns
    /// Number of entries removed.
    pub async fn purge_synced(&self) -> Result<usize> {
        let mut state = self.state.lock().await;

        let synced: Vec<ChangeId> = state
            .entries
            .values()
            .filter(|c| c.synced)
            .map(|c| c.id)
            .collect();
        if synced.is_empty() {
            return Ok(0);
        }

        let removed: Vec<PendingChange> = synced
            .iter()
            .filter_map(|id| state.entries.remove(id))
            .collect();

        if let Err(e) = self.persist(&state).await {
            for change in removed {
                state.entries.insert(change.id, change);
            }
            return Err(e);
        }

        debug!(purged = removed.len(), "Purged synced ledger entries");
        Ok(removed.len())
    }

    /// Get an entry by id.
    pub async fn get(&self, id: ChangeId) -> Option<PendingChange> {
        self.state.lock().await.entries.get(&id).cloned()
    }

    /// Number of entries still waiting for acknowledgment.
    pub async fn unsynced_count(&self) -> usize {
        self.state
            .lock()
            .await
            .entries
            .values()
            .filter(|c| !c.synced)
            .count()
    }

    /// Number of readable entries, synced or not.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Number of rows quarantined as unreadable when the ledger was opened.
    pub async fn corrupt_count(&self) -> usize {
        self.state.lock().await.quarantined.len()
    }

    async fn persist(&self, state: &LedgerState) -> Result<()> {
        self.engine.write_table(LEDGER_TABLE, state.encode()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sehatlink_storage::{LocalEngine, MemoryEngine};
    use serde_json::json;
    use tempfile::TempDir;

    async fn memory_ledger() -> (MemoryEngine, PendingChangeLedger) {
        let engine = MemoryEngine::new();
        let ledger = PendingChangeLedger::open(Arc::new(engine.clone())).await.unwrap();
        (engine, ledger)
    }

    #[tokio::test]
    async fn test_append_starts_unsynced() {
        let (_, ledger) = memory_ledger().await;
        let change = ledger
            .append(RecordKind::Reminder, json!({ "id": "r1" }))
            .await
            .unwrap();

        assert!(!change.synced);
        assert_eq!(change.id, ChangeId::new(1));
        assert_eq!(ledger.unsynced_count().await, 1);
    }

    #[tokio::test]
    async fn test_list_unsynced_in_creation_order() {
        let (_, ledger) = memory_ledger().await;
        let a = ledger.append(RecordKind::Reminder, json!({ "n": 1 })).await.unwrap();
        let b = ledger.append(RecordKind::SymptomCheck, json!({ "n": 2 })).await.unwrap();
        let c = ledger.append(RecordKind::Reminder, json!({ "n": 3 })).await.unwrap();

        let ids: Vec<_> = ledger.list_unsynced().await.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
        assert!(a.created_at <= b.created_at && b.created_at <= c.created_at);
    }

    #[tokio::test]
    async fn test_list_unsynced_of_kind() {
        let (_, ledger) = memory_ledger().await;
        let a = ledger.append(RecordKind::Reminder, json!({ "n": 1 })).await.unwrap();
        let b = ledger.append(RecordKind::NutritionEntry, json!({ "n": 2 })).await.unwrap();
        let c = ledger.append(RecordKind::Reminder, json!({ "n": 3 })).await.unwrap();
        ledger.mark_synced(c.id).await.unwrap();

        let reminders: Vec<_> = ledger
            .list_unsynced_of(RecordKind::Reminder)
            .await
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(reminders, vec![a.id]);

        let meals = ledger.list_unsynced_of(RecordKind::NutritionEntry).await;
        assert_eq!(meals.len(), 1);
        assert_eq!(meals[0].id, b.id);
        assert!(ledger.list_unsynced_of(RecordKind::SymptomCheck).await.is_empty());
    }

    #[tokio::test]
    async fn test_mark_synced_is_idempotent() {
        let (_, ledger) = memory_ledger().await;
        let change = ledger.append(RecordKind::Reminder, json!({})).await.unwrap();

        ledger.mark_synced(change.id).await.unwrap();
        ledger.mark_synced(change.id).await.unwrap();
        ledger.mark_synced(ChangeId::new(999)).await.unwrap();

        assert!(ledger.get(change.id).await.unwrap().synced);
        assert!(ledger.list_unsynced().await.is_empty());
    }

    #[tokio::test]
    async fn test_purge_only_removes_synced() {
        let (_, ledger) = memory_ledger().await;
        let a = ledger.append(RecordKind::Reminder, json!({})).await.unwrap();
        let b = ledger.append(RecordKind::Reminder, json!({})).await.unwrap();

        ledger.mark_synced(a.id).await.unwrap();
        assert_eq!(ledger.purge_synced().await.unwrap(), 1);
        assert_eq!(ledger.purge_synced().await.unwrap(), 0);

        assert!(ledger.get(a.id).await.is_none());
        assert!(ledger.get(b.id).await.is_some());
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_append_leaves_ledger_unchanged() {
        let (engine, ledger) = memory_ledger().await;
        engine.set_available(false);

        let err = ledger.append(RecordKind::Reminder, json!({})).await.unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
        assert!(ledger.is_empty().await);

        engine.set_available(true);
        let change = ledger.append(RecordKind::Reminder, json!({})).await.unwrap();
        assert_eq!(change.id, ChangeId::new(1));
    }

    #[tokio::test]
    async fn test_failed_mark_reverts() {
        let (engine, ledger) = memory_ledger().await;
        let change = ledger.append(RecordKind::Reminder, json!({})).await.unwrap();

        engine.set_available(false);
        assert!(ledger.mark_synced(change.id).await.is_err());
        assert!(!ledger.get(change.id).await.unwrap().synced);
    }

    #[tokio::test]
    async fn test_persistence_and_id_continuity() {
        let temp = TempDir::new().unwrap();
        {
            let engine = Arc::new(LocalEngine::new(temp.path()).unwrap());
            let ledger = PendingChangeLedger::open(engine).await.unwrap();
            ledger.append(RecordKind::Reminder, json!({ "id": "r1" })).await.unwrap();
            ledger.append(RecordKind::Reminder, json!({ "id": "r2" })).await.unwrap();
        }

        let engine = Arc::new(LocalEngine::new(temp.path()).unwrap());
        let ledger = PendingChangeLedger::open(engine).await.unwrap();
        assert_eq!(ledger.unsynced_count().await, 2);

        let next = ledger.append(RecordKind::Reminder, json!({})).await.unwrap();
        assert_eq!(next.id, ChangeId::new(3));
    }

    #[tokio::test]
    async fn test_persisted_row_layout() {
        let (engine, ledger) = memory_ledger().await;
        ledger
            .append(RecordKind::NutritionEntry, json!({ "food": "rice" }))
            .await
            .unwrap();

        let raw = engine.read_table(LEDGER_TABLE).await.unwrap().unwrap();
        let rows: Vec<Value> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(rows[0]["type"], "nutrition_log");
        assert_eq!(rows[0]["data"]["food"], "rice");
        assert_eq!(rows[0]["synced"], false);
        assert!(rows[0]["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_unreadable_rows_quarantined() {
        let engine = MemoryEngine::new();
        let rows = json!([
            { "id": 4, "type": "reminder", "data": {}, "timestamp": 1_700_000_000_000i64, "synced": false },
            { "id": 7, "type": "patient_note", "data": {}, "timestamp": 1_700_000_000_001i64, "synced": false }
        ]);
        engine
            .write_table(LEDGER_TABLE, serde_json::to_vec(&rows).unwrap())
            .await
            .unwrap();

        let ledger = PendingChangeLedger::open(Arc::new(engine.clone())).await.unwrap();
        assert_eq!(ledger.unsynced_count().await, 1);
        assert_eq!(ledger.corrupt_count().await, 1);

        // The quarantined row's id is never reused and the row survives writes
        let next = ledger.append(RecordKind::Reminder, json!({})).await.unwrap();
        assert_eq!(next.id, ChangeId::new(8));
        let raw = engine.read_table(LEDGER_TABLE).await.unwrap().unwrap();
        let stored: Vec<Value> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn test_decode_record_flags_corruption() {
        let (_, ledger) = memory_ledger().await;
        let change = ledger
            .append(RecordKind::Reminder, json!({ "id": "r1" }))
            .await
            .unwrap();
        assert!(matches!(
            change.decode_record(),
            Err(Error::LedgerCorruption(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_unsynced_is_ordered_and_complete(marks in proptest::collection::vec(any::<bool>(), 1..24)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let (_, ledger) = memory_ledger().await;
                let mut expected = Vec::new();
                for (i, mark) in marks.iter().enumerate() {
                    let change = ledger
                        .append(RecordKind::Reminder, json!({ "seq": i }))
                        .await
                        .unwrap();
                    if *mark {
                        ledger.mark_synced(change.id).await.unwrap();
                    } else {
                        expected.push(change.id);
                    }
                }
                ledger.purge_synced().await.unwrap();

                let listed: Vec<_> = ledger.list_unsynced().await.iter().map(|c| c.id).collect();
                assert_eq!(listed, expected);
                assert_eq!(ledger.len().await, expected.len());
            });
        }
    }
}
