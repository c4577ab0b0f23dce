//! Kind-partitioned record store.
//!
//! Each [`RecordKind`] owns one table. Tables are loaded once when the store
//! is opened and kept in memory; every write persists the whole table through
//! the engine before the in-memory copy is replaced, so a failed write leaves
//! the store exactly as it was.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::engine::StorageEngine;
use sehatlink_common::{
    Error, RecordId, RecordKind, Reminder, ReminderStatus, Result, StoredRecord,
};

/// In-memory image of one table.
#[derive(Debug, Clone, Default)]
struct Table {
    /// Records in storage order.
    records: Vec<StoredRecord>,
    /// Position of each record in `records`.
    index: HashMap<RecordId, usize>,
    /// Rows that could not be decoded. Written back untouched.
    unreadable: Vec<Value>,
}

impl Table {
    fn decode(kind: RecordKind, bytes: &[u8]) -> Result<Self> {
        let rows: Vec<Value> = serde_json::from_slice(bytes).map_err(|e| {
            Error::StorageUnavailable(format!("table '{}' unreadable: {}", kind.table_name(), e))
        })?;

        let mut table = Table::default();
        for row in rows {
            match StoredRecord::from_payload(kind, row.clone()) {
                Ok(record) => table.upsert(record),
                Err(e) => {
                    warn!(table = kind.table_name(), error = %e, "Skipping unreadable record");
                    table.unreadable.push(row);
                }
            }
        }
        Ok(table)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut rows = Vec::with_capacity(self.records.len() + self.unreadable.len());
        for record in &self.records {
            rows.push(record.to_payload()?);
        }
        rows.extend(self.unreadable.iter().cloned());
        Ok(serde_json::to_vec(&rows)?)
    }

    fn upsert(&mut self, record: StoredRecord) {
        match self.index.get(record.id()) {
            Some(&pos) => self.records[pos] = record,
            None => {
                self.index.insert(record.id().clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    fn get(&self, id: &RecordId) -> Option<&StoredRecord> {
        self.index.get(id).map(|&pos| &self.records[pos])
    }
}

/// Durable, kind-partitioned key-value store for health records.
///
/// The store never touches the pending-change ledger; enqueueing changes is
/// the job of the service facade.
pub struct LocalRecordStore {
    engine: Arc<dyn StorageEngine>,
    tables: HashMap<RecordKind, RwLock<Table>>,
}

impl LocalRecordStore {
    /// Open the store, loading every table from the engine.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the engine cannot be read or a table is not
    ///   a JSON array
    pub async fn open(engine: Arc<dyn StorageEngine>) -> Result<Self> {
        let mut tables = HashMap::new();

        for kind in RecordKind::ALL {
            let table = match engine.read_table(kind.table_name()).await? {
                Some(bytes) => Table::decode(kind, &bytes)?,
                None => Table::default(),
            };
            debug!(
                table = kind.table_name(),
                records = table.records.len(),
                "Loaded record table"
            );
            tables.insert(kind, RwLock::new(table));
        }

        Ok(Self { engine, tables })
    }

    /// Name of the underlying engine.
    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    fn table(&self, kind: RecordKind) -> &RwLock<Table> {
        // Every kind is inserted by `open`.
        &self.tables[&kind]
    }

    /// Insert or overwrite a record, keyed by its kind and id.
    ///
    /// # Errors
    /// - `InvalidInput` if the record fails validation
    /// - `StorageUnavailable` if the table cannot be written
    pub async fn put(&self, record: StoredRecord) -> Result<()> {
        record.validate()?;
        let kind = record.kind();
        // Keep the cached form identical to what a reload would produce.
        let record = StoredRecord::from_payload(kind, record.to_payload()?)?;

        let mut table = self.table(kind).write().await;
        let mut updated = table.clone();
        updated.upsert(record);

        self.engine
            .write_table(kind.table_name(), updated.encode()?)
            .await?;

        *table = updated;
        Ok(())
    }

    /// Get a record by kind and id.
    pub async fn get(&self, kind: RecordKind, id: &RecordId) -> Option<StoredRecord> {
        self.table(kind).read().await.get(id).cloned()
    }

    /// Get all records of a kind in storage order.
    pub async fn get_all(&self, kind: RecordKind) -> Vec<StoredRecord> {
        self.table(kind).read().await.records.clone()
    }

    /// Number of records of a kind.
    pub async fn count(&self, kind: RecordKind) -> usize {
        self.table(kind).read().await.records.len()
    }

    /// Reminders with the given status, in storage order.
    pub async fn reminders_with_status(&self, status: ReminderStatus) -> Vec<Reminder> {
        self.table(RecordKind::Reminder)
            .read()
            .await
            .records
            .iter()
            .filter_map(StoredRecord::as_reminder)
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    /// Records of a kind whose timestamp is at or after `since`.
    ///
    /// Kinds without a timestamp (reminders) yield nothing.
    pub async fn records_since(&self, kind: RecordKind, since: DateTime<Utc>) -> Vec<StoredRecord> {
        self.table(kind)
            .read()
            .await
            .records
            .iter()
            .filter(|r| r.timestamp().is_some_and(|ts| ts >= since))
            .cloned()
            .collect()
    }

    /// Clear the local-only flag of a record the remote has acknowledged.
    ///
    /// The flag is only cleared when the stored record still has the content
    /// of the acknowledged snapshot; a record changed again since then stays
    /// local-only until its newer change is acknowledged.
    ///
    /// # Returns
    /// `true` if the flag was cleared.
    pub async fn mark_confirmed(&self, snapshot: &StoredRecord) -> Result<bool> {
        let kind = snapshot.kind();
        let mut table = self.table(kind).write().await;

        let current = match table.get(snapshot.id()) {
            Some(current) if current.is_local_only() && current.same_content(snapshot) => {
                current.clone()
            }
            _ => return Ok(false),
        };

        let mut confirmed = current;
        confirmed.set_local_only(false);
        let mut updated = table.clone();
        updated.upsert(confirmed);

        self.engine
            .write_table(kind.table_name(), updated.encode()?)
            .await?;

        *table = updated;
        Ok(true)
    }
}
