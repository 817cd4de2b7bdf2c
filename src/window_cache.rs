//! Last-known state of every record inside the live window.
//!
//! The cache is the "previous state" of a change: without it a `modified`
//! or `removed` event cannot be turned into a delta. It is bounded by the
//! feed window (the store decides membership) and owned by exactly one
//! session task.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::models::CaseRecord;

#[derive(Debug, Clone)]
pub struct WindowCache {
    entries: HashMap<String, CaseRecord>,
    /// `(created_at, id)` of every entry, kept in step with `entries`.
    by_age: BTreeSet<(DateTime<Utc>, String)>,
    capacity: usize,
}

impl WindowCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            by_age: BTreeSet::new(),
            capacity,
        }
    }

    /// Replace the whole content with a snapshot.
    pub fn seed(&mut self, records: impl IntoIterator<Item = CaseRecord>) {
        self.clear();
        for record in records {
            self.upsert(record);
        }
    }

    pub fn get(&self, id: &str) -> Option<&CaseRecord> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Store the new state, returning the previous one if any.
    pub fn upsert(&mut self, record: CaseRecord) -> Option<CaseRecord> {
        let age_key = (record.created_at, record.id.clone());
        let previous = self.entries.insert(record.id.clone(), record);
        if let Some(prev) = &previous {
            self.by_age.remove(&(prev.created_at, prev.id.clone()));
        }
        self.by_age.insert(age_key);
        previous
    }

    pub fn remove(&mut self, id: &str) -> Option<CaseRecord> {
        let previous = self.entries.remove(id)?;
        self.by_age.remove(&(previous.created_at, previous.id.clone()));
        Some(previous)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_age.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn newest_created_at(&self) -> Option<DateTime<Utc>> {
        self.by_age.last().map(|(created_at, _)| *created_at)
    }

    pub fn oldest_created_at(&self) -> Option<DateTime<Utc>> {
        self.by_age.first().map(|(created_at, _)| *created_at)
    }

    /// Cached records, newest first.
    pub fn records_sorted(&self) -> Vec<&CaseRecord> {
        let mut records: Vec<&CaseRecord> = self.entries.values().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }
}
