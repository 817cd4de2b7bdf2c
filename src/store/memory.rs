//! In-process case store with live window listeners.
//!
//! Every write recomputes the top-N window of each open listener and
//! delivers the diff, which reproduces the boundary behaviour of a
//! limit-bounded query listener (records scrolling in and out of N).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::feed::{diff_windows, FeedEvent, FeedSender, FeedSubscription, DEFAULT_FEED_CAPACITY};
use super::{CaseFilter, CaseStore, ClinicInfo, StoreError};
use crate::models::CaseRecord;

struct Listener {
    filter: CaseFilter,
    limit: usize,
    window: Vec<CaseRecord>,
    tx: FeedSender,
}

#[derive(Default)]
struct Inner {
    cases: HashMap<String, CaseRecord>,
    clinics: HashMap<String, ClinicInfo>,
    listeners: Vec<Listener>,
}

/// Thread-safe in-memory store.
pub struct MemoryCaseStore {
    inner: Mutex<Inner>,
    fetches: AtomicUsize,
    feed_capacity: usize,
}

impl Default for MemoryCaseStore {
    fn default() -> Self {
        Self {
            inner: Mutex::default(),
            fetches: AtomicUsize::new(0),
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue depth of every feed opened afterwards.
    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity.max(1);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }

    // ── Writes ───────────────────────────────────────────

    /// Insert or replace a case, notifying listeners.
    pub fn upsert(&self, record: CaseRecord) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.cases.insert(record.id.clone(), record);
        notify(&mut inner);
        Ok(())
    }

    /// Insert or replace a case from a raw JSON document.
    pub fn upsert_json(&self, id: &str, json: &str) -> Result<(), StoreError> {
        let record = CaseRecord::from_json(id, json)?;
        self.upsert(record)
    }

    /// Delete a case. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let existed = inner.cases.remove(id).is_some();
        if existed {
            notify(&mut inner);
        }
        Ok(existed)
    }

    pub fn add_clinic(&self, info: ClinicInfo) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.clinics.insert(info.clinic_id.clone(), info);
        Ok(())
    }

    // ── Introspection ────────────────────────────────────

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.cases.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `fetch` round trips served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Open listeners, after pruning those whose subscriber went away.
    pub fn subscriber_count(&self) -> usize {
        match self.lock() {
            Ok(mut inner) => {
                inner.listeners.retain(|l| !l.tx.is_closed());
                inner.listeners.len()
            }
            Err(_) => 0,
        }
    }

    /// Simulate a lost connection: every open feed receives `FeedClosed`.
    pub fn drop_subscribers(&self) {
        if let Ok(mut inner) = self.lock() {
            for listener in inner.listeners.drain(..) {
                let _ = listener.tx.send(Err(StoreError::FeedClosed));
            }
        }
    }
}

/// The `limit` newest matching records, newest first (ties broken by id).
fn window_of(cases: &HashMap<String, CaseRecord>, filter: &CaseFilter, limit: usize) -> Vec<CaseRecord> {
    let mut matching: Vec<&CaseRecord> = cases.values().filter(|r| filter.matches(r)).collect();
    matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    matching.into_iter().take(limit).cloned().collect()
}

fn notify(inner: &mut Inner) {
    let Inner { cases, listeners, .. } = inner;
    listeners.retain_mut(|listener| {
        let next = window_of(cases, &listener.filter, listener.limit);
        let changes = diff_windows(&listener.window, &next);
        listener.window = next;
        if changes.is_empty() {
            return !listener.tx.is_closed();
        }
        listener.tx.send(Ok(FeedEvent::Changes(changes))).is_ok()
    });
}

impl CaseStore for MemoryCaseStore {
    async fn fetch(&self, filter: &CaseFilter) -> Result<Vec<CaseRecord>, StoreError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let inner = self.lock()?;
        Ok(inner
            .cases
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn subscribe(&self, filter: &CaseFilter, limit: usize) -> Result<FeedSubscription, StoreError> {
        let (tx, subscription) = FeedSubscription::with_capacity(self.feed_capacity);
        let mut inner = self.lock()?;
        let window = window_of(&inner.cases, filter, limit);
        tx.send(Ok(FeedEvent::Snapshot(window.clone())))?;
        inner.listeners.push(Listener {
            filter: filter.clone(),
            limit,
            window,
            tx,
        });
        tracing::debug!(limit, listeners = inner.listeners.len(), "Memory feed opened");
        Ok(subscription)
    }

    async fn lookup_clinics(&self, clinic_ids: &[String]) -> Result<Vec<ClinicInfo>, StoreError> {
        let inner = self.lock()?;
        Ok(clinic_ids
            .iter()
            .filter_map(|id| inner.clinics.get(id).cloned())
            .collect())
    }
}
