//! Common utilities and types shared across SehatLink offline modules.
//!
//! This module provides the shared error type, identifiers, and the typed
//! health records persisted by the store and replayed by the sync engine.

pub mod error;
pub mod records;
pub mod types;

pub use error::{Error, Result};
pub use records::{
    now_millis, parse_time_of_day, AnalysisResult, NutritionEntry, Recurrence, Reminder,
    ReminderStatus, ReminderType, Severity, StoredRecord, SymptomCheck,
};
pub use types::{ChangeId, RecordId, RecordKind};
