//! SehatLink Sync Engine
//!
//! This module reconciles locally saved health records with the remote
//! authority, including:
//! - Pending-change ledger of unconfirmed mutations
//! - Edge-triggered connectivity monitoring
//! - Serialized, coalescing drains with partial-failure semantics
//! - Retry strategy with exponential backoff for transient errors
//! - Background scheduling on reconnect, on a timer, or on demand

pub mod connectivity;
pub mod engine;
pub mod ledger;
pub mod remote;
pub mod retry;
pub mod scheduler;

// Re-export main types
pub use connectivity::{
    Connectivity, ConnectivityEvent, ConnectivityMonitor, ConnectivityProbe, HttpProbe,
    StaticProbe,
};
pub use engine::{DrainOutcome, DrainReport, SyncConfig, SyncEngine, SyncStatus};
pub use ledger::{PendingChange, PendingChangeLedger, LEDGER_TABLE};
pub use remote::{ChangeSubmission, HttpRemote, InMemoryRemote, RemoteAuthority};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _monitor = ConnectivityMonitor::new(false);
        let _remote = InMemoryRemote::new();
    }
}
