//! Identifiers and record kinds used throughout SehatLink offline storage.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

/// Domain record kind. Each kind has its own table in the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Medication, checkup and exercise reminders.
    Reminder,
    /// Food log entries.
    #[serde(rename = "nutrition_log")]
    NutritionEntry,
    /// Saved symptom analyses.
    SymptomCheck,
}

impl RecordKind {
    /// Every kind, in table creation order.
    pub const ALL: [RecordKind; 3] = [
        RecordKind::Reminder,
        RecordKind::NutritionEntry,
        RecordKind::SymptomCheck,
    ];

    /// Wire name used in ledger entries and remote submissions.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Reminder => "reminder",
            RecordKind::NutritionEntry => "nutrition_log",
            RecordKind::SymptomCheck => "symptom_check",
        }
    }

    /// Name of the persisted table holding records of this kind.
    pub fn table_name(&self) -> &'static str {
        match self {
            RecordKind::Reminder => "reminders",
            RecordKind::NutritionEntry => "nutrition",
            RecordKind::SymptomCheck => "symptom_checks",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "reminder" | "reminders" => Ok(RecordKind::Reminder),
            "nutrition_log" | "nutrition" => Ok(RecordKind::NutritionEntry),
            "symptom_check" | "symptom_checks" | "symptoms" => Ok(RecordKind::SymptomCheck),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown record kind: {}",
                other
            ))),
        }
    }
}

/// Identifier of a stored record, unique within its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

static LAST_GENERATED_MS: AtomicI64 = AtomicI64::new(0);

impl RecordId {
    /// Create a new RecordId from a caller-supplied string.
    ///
    /// # Errors
    /// - Returns error if id is empty or only whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "RecordId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a clock-assigned id (milliseconds since the epoch).
    ///
    /// Ids generated within the same process are strictly increasing, so two
    /// records created in the same millisecond never collide.
    pub fn generate() -> Self {
        let now = Utc::now().timestamp_millis();
        let mut last = LAST_GENERATED_MS.load(Ordering::Relaxed);
        loop {
            let next = if now > last { now } else { last + 1 };
            match LAST_GENERATED_MS.compare_exchange_weak(
                last,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Self(next.to_string()),
                Err(actual) => last = actual,
            }
        }
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RecordId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a pending change in the ledger. Monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(u64);

impl ChangeId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// The id following this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_record_id_creation() {
        let id = RecordId::new("r1").unwrap();
        assert_eq!(id.as_str(), "r1");
    }

    #[test]
    fn test_record_id_empty_fails() {
        assert!(RecordId::new("").is_err());
        assert!(RecordId::new("   ").is_err());
    }

    #[test]
    fn test_record_id_rejects_empty_on_deserialize() {
        let result: std::result::Result<RecordId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_generated_ids_are_increasing() {
        let a = RecordId::generate();
        let b = RecordId::generate();
        let a: i64 = a.as_str().parse().unwrap();
        let b: i64 = b.as_str().parse().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(RecordKind::Reminder.as_str(), "reminder");
        assert_eq!(RecordKind::NutritionEntry.table_name(), "nutrition");
        assert_eq!(
            serde_json::to_string(&RecordKind::NutritionEntry).unwrap(),
            "\"nutrition_log\""
        );
        assert_eq!(
            serde_json::to_string(&RecordKind::SymptomCheck).unwrap(),
            "\"symptom_check\""
        );
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("reminder".parse::<RecordKind>().unwrap(), RecordKind::Reminder);
        assert_eq!("nutrition".parse::<RecordKind>().unwrap(), RecordKind::NutritionEntry);
        assert!("patient_note".parse::<RecordKind>().is_err());
    }

    proptest! {
        #[test]
        fn prop_kind_display_round_trips(idx in 0usize..3) {
            let kind = RecordKind::ALL[idx];
            prop_assert_eq!(kind.to_string().parse::<RecordKind>().unwrap(), kind);
        }

        #[test]
        fn prop_non_blank_ids_accepted(s in "[a-z0-9-]{1,24}") {
            let id = RecordId::new(s.clone()).unwrap();
            prop_assert_eq!(id.as_str(), s.as_str());
        }
    }
}
