//! Typed health records persisted offline.
//!
//! Each record kind maps to one table in the record store. Ledger payloads are
//! the JSON form of the inner record (not the [`StoredRecord`] envelope), so a
//! payload plus its [`RecordKind`] is enough to rebuild the record.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{RecordId, RecordKind};
use crate::{Error, Result};

/// Completion state of a reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Done,
    Missed,
}

/// What a reminder is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderType {
    Medication,
    Checkup,
    Exercise,
}

/// How often a reminder repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    Once,
    #[default]
    Daily,
    Weekly,
}

/// Serde adapter for "HH:MM" times of day.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Current time truncated to the millisecond precision records are stored with.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Parse an "HH:MM" time of day.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|e| Error::InvalidInput(format!("Invalid time of day '{}': {}", s, e)))
}

/// A health reminder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub id: RecordId,
    pub title: String,
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    pub status: ReminderStatus,
    #[serde(rename = "type")]
    pub reminder_type: ReminderType,
    #[serde(default)]
    pub recurrence: Recurrence,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_local_only: bool,
}

impl Reminder {
    /// Create a pending, daily reminder with a clock-assigned id.
    pub fn new(title: impl Into<String>, time: NaiveTime, reminder_type: ReminderType) -> Self {
        Self {
            id: RecordId::generate(),
            title: title.into(),
            time,
            status: ReminderStatus::Pending,
            reminder_type,
            recurrence: Recurrence::default(),
            description: String::new(),
            is_local_only: false,
        }
    }

    pub fn with_id(mut self, id: RecordId) -> Self {
        self.id = id;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = recurrence;
        self
    }
}

/// A logged food item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NutritionEntry {
    pub id: RecordId,
    pub food: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_local_only: bool,
}

impl NutritionEntry {
    pub fn new(food: impl Into<String>) -> Self {
        Self {
            id: RecordId::generate(),
            food: food.into(),
            timestamp: now_millis(),
            is_local_only: false,
        }
    }
}

/// Severity reported by the symptom classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Structured result returned by the external symptom classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub condition: String,
    #[serde(default)]
    pub description: String,
    /// Percentage, 0 to 100.
    pub confidence: u8,
    pub severity: Severity,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub similar_cases: u32,
    #[serde(default)]
    pub seek_medical_help: bool,
}

/// A saved symptom analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymptomCheck {
    pub id: RecordId,
    pub symptoms: String,
    pub result: AnalysisResult,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_local_only: bool,
}

impl SymptomCheck {
    pub fn new(symptoms: impl Into<String>, result: AnalysisResult) -> Self {
        Self {
            id: RecordId::generate(),
            symptoms: symptoms.into(),
            result,
            timestamp: now_millis(),
            is_local_only: false,
        }
    }
}

/// Any record that can live in the record store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredRecord {
    Reminder(Reminder),
    NutritionEntry(NutritionEntry),
    SymptomCheck(SymptomCheck),
}

impl StoredRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            StoredRecord::Reminder(_) => RecordKind::Reminder,
            StoredRecord::NutritionEntry(_) => RecordKind::NutritionEntry,
            StoredRecord::SymptomCheck(_) => RecordKind::SymptomCheck,
        }
    }

    pub fn id(&self) -> &RecordId {
        match self {
            StoredRecord::Reminder(r) => &r.id,
            StoredRecord::NutritionEntry(n) => &n.id,
            StoredRecord::SymptomCheck(s) => &s.id,
        }
    }

    pub fn is_local_only(&self) -> bool {
        match self {
            StoredRecord::Reminder(r) => r.is_local_only,
            StoredRecord::NutritionEntry(n) => n.is_local_only,
            StoredRecord::SymptomCheck(s) => s.is_local_only,
        }
    }

    pub fn set_local_only(&mut self, local_only: bool) {
        match self {
            StoredRecord::Reminder(r) => r.is_local_only = local_only,
            StoredRecord::NutritionEntry(n) => n.is_local_only = local_only,
            StoredRecord::SymptomCheck(s) => s.is_local_only = local_only,
        }
    }

    /// Creation timestamp, for kinds that carry one.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            StoredRecord::Reminder(_) => None,
            StoredRecord::NutritionEntry(n) => Some(n.timestamp),
            StoredRecord::SymptomCheck(s) => Some(s.timestamp),
        }
    }

    pub fn as_reminder(&self) -> Option<&Reminder> {
        match self {
            StoredRecord::Reminder(r) => Some(r),
            _ => None,
        }
    }

    /// Check field-level constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        match self {
            StoredRecord::Reminder(r) if r.title.trim().is_empty() => Err(Error::InvalidInput(
                "Reminder title cannot be empty".to_string(),
            )),
            StoredRecord::NutritionEntry(n) if n.food.trim().is_empty() => Err(
                Error::InvalidInput("Nutrition entry food cannot be empty".to_string()),
            ),
            StoredRecord::SymptomCheck(s) if s.result.confidence > 100 => Err(
                Error::InvalidInput(format!("Confidence out of range: {}", s.result.confidence)),
            ),
            _ => Ok(()),
        }
    }

    /// Serialize the inner record into a ledger payload.
    pub fn to_payload(&self) -> Result<Value> {
        let value = match self {
            StoredRecord::Reminder(r) => serde_json::to_value(r)?,
            StoredRecord::NutritionEntry(n) => serde_json::to_value(n)?,
            StoredRecord::SymptomCheck(s) => serde_json::to_value(s)?,
        };
        Ok(value)
    }

    /// Rebuild a record from its kind and payload.
    pub fn from_payload(kind: RecordKind, payload: Value) -> Result<Self> {
        let record = match kind {
            RecordKind::Reminder => StoredRecord::Reminder(serde_json::from_value(payload)?),
            RecordKind::NutritionEntry => {
                StoredRecord::NutritionEntry(serde_json::from_value(payload)?)
            }
            RecordKind::SymptomCheck => {
                StoredRecord::SymptomCheck(serde_json::from_value(payload)?)
            }
        };
        Ok(record)
    }

    /// Whether this record carries the same content as `other`, ignoring the
    /// local-only flag.
    pub fn same_content(&self, other: &StoredRecord) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.set_local_only(false);
        b.set_local_only(false);
        a == b
    }
}

impl From<Reminder> for StoredRecord {
    fn from(r: Reminder) -> Self {
        StoredRecord::Reminder(r)
    }
}

impl From<NutritionEntry> for StoredRecord {
    fn from(n: NutritionEntry) -> Self {
        StoredRecord::NutritionEntry(n)
    }
}

impl From<SymptomCheck> for StoredRecord {
    fn from(s: SymptomCheck) -> Self {
        StoredRecord::SymptomCheck(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pill_reminder() -> Reminder {
        Reminder::new(
            "Take pill",
            parse_time_of_day("20:00").unwrap(),
            ReminderType::Medication,
        )
        .with_id(RecordId::new("r1").unwrap())
    }

    #[test]
    fn test_reminder_payload_shape() {
        let record = StoredRecord::from(pill_reminder());
        let payload = record.to_payload().unwrap();

        assert_eq!(payload["id"], "r1");
        assert_eq!(payload["time"], "20:00");
        assert_eq!(payload["status"], "pending");
        assert_eq!(payload["type"], "medication");
        assert_eq!(payload["isLocalOnly"], false);
    }

    #[test]
    fn test_payload_rebuilds_record() {
        let record = StoredRecord::from(pill_reminder());
        let payload = record.to_payload().unwrap();
        let rebuilt = StoredRecord::from_payload(RecordKind::Reminder, payload).unwrap();
        assert_eq!(rebuilt, record);
    }

    #[test]
    fn test_payload_of_wrong_kind_fails() {
        let record = StoredRecord::from(NutritionEntry::new("rice"));
        let payload = record.to_payload().unwrap();
        assert!(StoredRecord::from_payload(RecordKind::Reminder, payload).is_err());
    }

    #[test]
    fn test_camel_case_reminder_json_accepted() {
        let json = serde_json::json!({
            "id": "1",
            "title": "Take TB Medicine",
            "time": "20:00",
            "status": "pending",
            "type": "medication",
            "description": "Take your tuberculosis medication with water"
        });
        let record = StoredRecord::from_payload(RecordKind::Reminder, json).unwrap();
        let reminder = record.as_reminder().unwrap();
        assert_eq!(reminder.recurrence, Recurrence::Daily);
        assert!(!reminder.is_local_only);
    }

    #[test]
    fn test_bad_time_rejected() {
        assert!(parse_time_of_day("25:99").is_err());
        assert!(parse_time_of_day("noon").is_err());
    }

    #[test]
    fn test_same_content_ignores_local_flag() {
        let a = StoredRecord::from(pill_reminder());
        let mut b = a.clone();
        b.set_local_only(true);
        assert!(a.same_content(&b));

        if let StoredRecord::Reminder(r) = &mut b {
            r.status = ReminderStatus::Done;
        }
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_validation() {
        let mut reminder = pill_reminder();
        reminder.title = "  ".to_string();
        assert!(StoredRecord::from(reminder).validate().is_err());

        let check = SymptomCheck::new(
            "fever",
            AnalysisResult {
                condition: "Common Cold".to_string(),
                description: String::new(),
                confidence: 101,
                severity: Severity::Low,
                recommendations: vec![],
                similar_cases: 0,
                seek_medical_help: false,
            },
        );
        assert!(StoredRecord::from(check).validate().is_err());
    }

    #[test]
    fn test_nutrition_timestamp_is_millis() {
        let entry = NutritionEntry::new("dal");
        let payload = StoredRecord::from(entry.clone()).to_payload().unwrap();
        assert_eq!(payload["timestamp"], entry.timestamp.timestamp_millis());
    }
}
