//! The countable work item and its raw document shape.
//!
//! Documents arrive from the store as loosely-shaped JSON. `CaseDocument`
//! captures the fields the counters care about with typed optionals, and
//! `CaseRecord` is the validated form everything downstream works with.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════
// CaseRecord
// ═══════════════════════════════════════════════════════════

/// One case as seen by the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: String,
    /// Immutable once set; drives feed ordering.
    pub created_at: DateTime<Utc>,
    pub doctor_completed: bool,
    pub pharmacist_completed: bool,
    pub is_incomplete: bool,
    /// Terminal timestamp: set when the case completes or is marked incomplete.
    pub completed_at: Option<DateTime<Utc>>,
    pub emr_numbers: Vec<String>,
    pub clinic_id: Option<String>,
    pub partner_name: Option<String>,
    pub assigned_doctor: Option<String>,
    pub pharmacist_id: Option<String>,
    pub created_by: Option<String>,
}

impl CaseRecord {
    /// A fresh, fully pending case with no ownership set.
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
            doctor_completed: false,
            pharmacist_completed: false,
            is_incomplete: false,
            completed_at: None,
            emr_numbers: Vec::new(),
            clinic_id: None,
            partner_name: None,
            assigned_doctor: None,
            pharmacist_id: None,
            created_by: None,
        }
    }

    /// Number of countable units this record stands for (always >= 1).
    pub fn sub_unit_count(&self) -> u64 {
        if self.emr_numbers.is_empty() {
            1
        } else {
            self.emr_numbers.len() as u64
        }
    }

    pub fn is_completed(&self) -> bool {
        self.doctor_completed && self.pharmacist_completed
    }

    /// Parse a raw JSON document body for the given document id.
    pub fn from_json(id: &str, json: &str) -> Result<Self, RecordError> {
        let doc: CaseDocument = serde_json::from_str(json)?;
        doc.into_record(id)
    }

    /// Parse an already-decoded JSON value for the given document id.
    pub fn from_value(id: &str, value: serde_json::Value) -> Result<Self, RecordError> {
        let doc: CaseDocument = serde_json::from_value(value)?;
        doc.into_record(id)
    }
}

// ═══════════════════════════════════════════════════════════
// CaseDocument: store boundary
// ═══════════════════════════════════════════════════════════

/// Timestamp encodings accepted from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimestampValue {
    Rfc3339(String),
    Millis(i64),
    Parts {
        #[serde(alias = "_seconds")]
        seconds: i64,
        #[serde(default, alias = "_nanoseconds")]
        nanoseconds: u32,
    },
}

impl TimestampValue {
    fn to_utc(&self, field: &'static str) -> Result<DateTime<Utc>, RecordError> {
        let parsed = match self {
            Self::Rfc3339(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            Self::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
            Self::Parts { seconds, nanoseconds } => Utc.timestamp_opt(*seconds, *nanoseconds).single(),
        };
        parsed.ok_or(RecordError::InvalidTimestamp { field })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignedDoctors {
    pub primary: Option<String>,
}

/// Raw case document as stored. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseDocument {
    pub created_at: Option<TimestampValue>,
    #[serde(default)]
    pub doctor_completed: Option<bool>,
    #[serde(default)]
    pub pharmacist_completed: Option<bool>,
    #[serde(default)]
    pub is_incomplete: Option<bool>,
    /// Free-form status marker; `"incomplete"` is treated like `isIncomplete`.
    #[serde(default)]
    pub status: Option<String>,
    pub completed_at: Option<TimestampValue>,
    #[serde(default)]
    pub emr_numbers: Option<Vec<String>>,
    pub clinic_id: Option<String>,
    pub partner_name: Option<String>,
    pub assigned_doctors: Option<AssignedDoctors>,
    pub pharmacist_id: Option<String>,
    pub created_by: Option<String>,
}

impl CaseDocument {
    /// Validate and convert. `createdAt` is required; flags default to false.
    pub fn into_record(self, id: &str) -> Result<CaseRecord, RecordError> {
        if id.trim().is_empty() {
            return Err(RecordError::MissingField("id"));
        }
        let created_at = self
            .created_at
            .as_ref()
            .ok_or(RecordError::MissingField("createdAt"))?
            .to_utc("createdAt")?;
        let completed_at = match &self.completed_at {
            Some(ts) => Some(ts.to_utc("completedAt")?),
            None => None,
        };
        let status_incomplete = self
            .status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("incomplete"));

        Ok(CaseRecord {
            id: id.to_string(),
            created_at,
            doctor_completed: self.doctor_completed.unwrap_or(false),
            pharmacist_completed: self.pharmacist_completed.unwrap_or(false),
            is_incomplete: self.is_incomplete.unwrap_or(false) || status_incomplete,
            completed_at,
            emr_numbers: self.emr_numbers.unwrap_or_default(),
            clinic_id: non_empty(self.clinic_id),
            partner_name: non_empty(self.partner_name),
            assigned_doctor: non_empty(self.assigned_doctors.and_then(|d| d.primary)),
            pharmacist_id: non_empty(self.pharmacist_id),
            created_by: non_empty(self.created_by),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ═══════════════════════════════════════════════════════════
// Error type
// ═══════════════════════════════════════════════════════════

/// Document shapes rejected at the store boundary.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid timestamp in field {field}")]
    InvalidTimestamp { field: &'static str },
    #[error("Malformed document: {0}")]
    Json(#[from] serde_json::Error),
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sub_unit_count_defaults_to_one() {
        let record = CaseRecord::new("c1", Utc::now());
        assert_eq!(record.sub_unit_count(), 1);
    }

    #[test]
    fn sub_unit_count_follows_emr_numbers() {
        let mut record = CaseRecord::new("c1", Utc::now());
        record.emr_numbers = vec!["A".into(), "B".into(), "C".into()];
        assert_eq!(record.sub_unit_count(), 3);
    }

    #[test]
    fn parses_full_document() {
        let record = CaseRecord::from_value(
            "case-9",
            json!({
                "createdAt": "2026-03-10T08:00:00Z",
                "doctorCompleted": true,
                "pharmacistCompleted": false,
                "completedAt": 1_773_130_000_000_i64,
                "emrNumbers": ["E1", "E2"],
                "clinicId": "clinic-1",
                "assignedDoctors": { "primary": "doc-1" },
                "pharmacistId": "ph-1",
                "createdBy": "agent-1",
                "somethingElse": { "ignored": true }
            }),
        )
        .unwrap();

        assert_eq!(record.id, "case-9");
        assert!(record.doctor_completed);
        assert!(!record.pharmacist_completed);
        assert!(!record.is_incomplete);
        assert!(record.completed_at.is_some());
        assert_eq!(record.sub_unit_count(), 2);
        assert_eq!(record.assigned_doctor.as_deref(), Some("doc-1"));
        assert_eq!(record.pharmacist_id.as_deref(), Some("ph-1"));
        assert_eq!(record.created_by.as_deref(), Some("agent-1"));
    }

    #[test]
    fn missing_created_at_is_rejected() {
        let err = CaseRecord::from_value("c1", json!({ "doctorCompleted": true })).unwrap_err();
        assert!(matches!(err, RecordError::MissingField("createdAt")));
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let err = CaseRecord::from_value("c1", json!({ "createdAt": "yesterday" })).unwrap_err();
        assert!(matches!(err, RecordError::InvalidTimestamp { field: "createdAt" }));
    }

    #[test]
    fn seconds_parts_timestamp_accepted() {
        let record = CaseRecord::from_value(
            "c1",
            json!({ "createdAt": { "_seconds": 1_773_130_000, "_nanoseconds": 0 } }),
        )
        .unwrap();
        assert_eq!(record.created_at.timestamp(), 1_773_130_000);
    }

    #[test]
    fn status_marker_sets_incomplete() {
        let record = CaseRecord::from_value(
            "c1",
            json!({ "createdAt": "2026-03-10T08:00:00Z", "status": "Incomplete" }),
        )
        .unwrap();
        assert!(record.is_incomplete);
    }

    #[test]
    fn null_and_blank_fields_default() {
        let record = CaseRecord::from_json(
            "c1",
            r#"{"createdAt":"2026-03-10T08:00:00Z","emrNumbers":null,"clinicId":"  ","doctorCompleted":null}"#,
        )
        .unwrap();
        assert!(record.emr_numbers.is_empty());
        assert!(record.clinic_id.is_none());
        assert!(!record.doctor_completed);
    }

    #[test]
    fn emr_entries_count_as_delivered() {
        let blanks = CaseRecord::from_value(
            "c1",
            json!({ "createdAt": "2026-03-10T08:00:00Z", "emrNumbers": ["", "", ""] }),
        )
        .unwrap();
        assert_eq!(blanks.sub_unit_count(), 3);

        let mixed = CaseRecord::from_value(
            "c2",
            json!({ "createdAt": "2026-03-10T08:00:00Z", "emrNumbers": ["", "X"] }),
        )
        .unwrap();
        assert_eq!(mixed.sub_unit_count(), 2);
    }

    #[test]
    fn empty_id_is_rejected() {
        let err = CaseRecord::from_value(" ", json!({ "createdAt": "2026-03-10T08:00:00Z" })).unwrap_err();
        assert!(matches!(err, RecordError::MissingField("id")));
    }
}
