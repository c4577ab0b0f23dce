//! In-memory storage engine for testing and memory-only sessions.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::engine::{validate_table_name, StorageEngine};
use sehatlink_common::{Error, Result};

const UNLIMITED: usize = usize::MAX;

/// In-memory storage engine.
///
/// All data is lost on drop. The engine can simulate the failure modes of
/// browser storage: being disabled outright, running out of quota, or
/// refusing writes to one table.
#[derive(Clone)]
pub struct MemoryEngine {
    tables: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    available: Arc<AtomicBool>,
    quota_bytes: Arc<AtomicUsize>,
    read_only_tables: Arc<RwLock<HashSet<String>>>,
}

impl MemoryEngine {
    /// Create a new empty memory engine with no quota.
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            quota_bytes: Arc::new(AtomicUsize::new(UNLIMITED)),
            read_only_tables: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Enable or disable the engine. A disabled engine fails every call.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Limit the total number of stored bytes. `None` removes the limit.
    pub fn set_quota(&self, bytes: Option<usize>) {
        self.quota_bytes
            .store(bytes.unwrap_or(UNLIMITED), Ordering::SeqCst);
    }

    /// Refuse (or re-allow) writes to a single table.
    pub fn set_table_writable(&self, table: &str, writable: bool) {
        if let Ok(mut tables) = self.read_only_tables.write() {
            if writable {
                tables.remove(table);
            } else {
                tables.insert(table.to_string());
            }
        }
    }

    /// Total bytes currently stored across all tables.
    pub fn used_bytes(&self) -> usize {
        self.tables
            .read()
            .map(|t| t.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StorageUnavailable("storage disabled".to_string()))
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> Error {
    Error::StorageUnavailable("memory engine lock poisoned".to_string())
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read_table(&self, table: &str) -> Result<Option<Vec<u8>>> {
        validate_table_name(table)?;
        self.ensure_available()?;

        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.get(table).cloned())
    }

    async fn write_table(&self, table: &str, data: Vec<u8>) -> Result<()> {
        validate_table_name(table)?;
        self.ensure_available()?;

        if self
            .read_only_tables
            .read()
            .map_err(|_| poisoned())?
            .contains(table)
        {
            return Err(Error::StorageUnavailable(format!(
                "table '{}' is not writable",
                table
            )));
        }

        let mut tables = self.tables.write().map_err(|_| poisoned())?;

        let quota = self.quota_bytes.load(Ordering::SeqCst);
        if quota != UNLIMITED {
            let others: usize = tables
                .iter()
                .filter(|(name, _)| name.as_str() != table)
                .map(|(_, bytes)| bytes.len())
                .sum();
            if others + data.len() > quota {
                warn!(table, quota, "Memory engine quota exceeded");
                return Err(Error::StorageUnavailable("quota exceeded".to_string()));
            }
        }

        tables.insert(table.to_string(), data);
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.ensure_available()?;
        let tables = self.tables.read().map_err(|_| poisoned())?;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
