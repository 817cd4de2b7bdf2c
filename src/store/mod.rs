//! External document store seam.
//!
//! The counters consume three capabilities from the case store:
//! - `fetch`: exact, server-filtered record sets (Initial Aggregator)
//! - `subscribe`: a top-N change feed ordered by `createdAt` descending
//! - `lookup_clinics`: batched clinic → partner resolution
//!
//! Two bundled backends implement the trait: `MemoryCaseStore` (live
//! listeners, used heavily in tests) and `SqliteCaseStore` (polling feed).

pub mod feed;
pub mod memory;
pub mod sqlite;

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CaseRecord, RecordError};

pub use feed::{
    diff_windows, ChangeKind, DocumentChange, FeedEvent, FeedItem, FeedSender, FeedSubscription, DEFAULT_FEED_CAPACITY,
};
pub use memory::MemoryCaseStore;
pub use sqlite::SqliteCaseStore;

// ═══════════════════════════════════════════════════════════
// Filters
// ═══════════════════════════════════════════════════════════

/// Ownership narrowing applied server-side. Unset fields do not narrow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct OwnerFilter {
    pub assigned_doctor: Option<String>,
    pub pharmacist_id: Option<String>,
    pub created_by: Option<String>,
}

impl OwnerFilter {
    pub fn is_unrestricted(&self) -> bool {
        self.assigned_doctor.is_none() && self.pharmacist_id.is_none() && self.created_by.is_none()
    }

    pub fn matches(&self, record: &CaseRecord) -> bool {
        eq_if_set(&self.assigned_doctor, &record.assigned_doctor)
            && eq_if_set(&self.pharmacist_id, &record.pharmacist_id)
            && eq_if_set(&self.created_by, &record.created_by)
    }
}

/// Equality and range predicates a store query supports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseFilter {
    pub owner: OwnerFilter,
    pub is_incomplete: Option<bool>,
    pub doctor_completed: Option<bool>,
    pub pharmacist_completed: Option<bool>,
    /// Half-open `[start, end)` range on `completedAt`.
    pub completed_between: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl CaseFilter {
    pub fn owned(owner: OwnerFilter) -> Self {
        Self {
            owner,
            ..Self::default()
        }
    }

    pub fn incomplete(mut self, value: bool) -> Self {
        self.is_incomplete = Some(value);
        self
    }

    pub fn doctor_completed(mut self, value: bool) -> Self {
        self.doctor_completed = Some(value);
        self
    }

    pub fn pharmacist_completed(mut self, value: bool) -> Self {
        self.pharmacist_completed = Some(value);
        self
    }

    pub fn completed_between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.completed_between = Some((start, end));
        self
    }

    /// Client-side evaluation, identical in meaning to the SQL rendering.
    pub fn matches(&self, record: &CaseRecord) -> bool {
        if !self.owner.matches(record) {
            return false;
        }
        if self.is_incomplete.is_some_and(|v| v != record.is_incomplete) {
            return false;
        }
        if self.doctor_completed.is_some_and(|v| v != record.doctor_completed) {
            return false;
        }
        if self
            .pharmacist_completed
            .is_some_and(|v| v != record.pharmacist_completed)
        {
            return false;
        }
        if let Some((start, end)) = self.completed_between {
            match record.completed_at {
                Some(at) if at >= start && at < end => {}
                _ => return false,
            }
        }
        true
    }
}

fn eq_if_set(wanted: &Option<String>, actual: &Option<String>) -> bool {
    match wanted {
        Some(w) => actual.as_deref() == Some(w.as_str()),
        None => true,
    }
}

// ═══════════════════════════════════════════════════════════
// Clinic lookup
// ═══════════════════════════════════════════════════════════

/// Partner affiliation of one clinic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicInfo {
    pub clinic_id: String,
    pub partner_name: String,
    pub clinic_code: Option<String>,
}

// ═══════════════════════════════════════════════════════════
// CaseStore trait
// ═══════════════════════════════════════════════════════════

/// Read-side access to the case collection.
///
/// All methods are suspension points; callers treat them as cancellable
/// by dropping the returned future.
pub trait CaseStore: Send + Sync + 'static {
    /// Every record matching `filter`, unordered.
    fn fetch(
        &self,
        filter: &CaseFilter,
    ) -> impl Future<Output = Result<Vec<CaseRecord>, StoreError>> + Send;

    /// Open a change feed over the `limit` most recently created records
    /// matching `filter`. The first item delivered is a full snapshot.
    fn subscribe(
        &self,
        filter: &CaseFilter,
        limit: usize,
    ) -> impl Future<Output = Result<FeedSubscription, StoreError>> + Send;

    /// Resolve clinic ids. Unknown ids are simply absent from the result.
    fn lookup_clinics(
        &self,
        clinic_ids: &[String],
    ) -> impl Future<Output = Result<Vec<ClinicInfo>, StoreError>> + Send;
}

// ═══════════════════════════════════════════════════════════
// Error type
// ═══════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Change feed closed by the store")]
    FeedClosed,

    #[error("Store task failed: {0}")]
    TaskFailed(String),

    #[error("Internal lock error")]
    LockPoisoned,

    #[error("Rejected document: {0}")]
    Document(#[from] RecordError),
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
