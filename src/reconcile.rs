//! Change-feed reconciliation.
//!
//! `Reconciler` is the synchronous core of a counting session: it owns the
//! Window Cache and the counter vector, and turns each feed delivery into
//! counter deltas. The first delivery only seeds the cache (those records
//! are already in the aggregate); every later one is diffed against the
//! cached previous state.
//!
//! Window-boundary crossings are counted as genuine changes, so a record
//! that scrolls into the window is counted again and one that scrolls out
//! is subtracted. `ReconcileStats::boundary_suspects` tracks how often that
//! likely happened.

use std::sync::Arc;

use serde::Serialize;

use crate::clock::TodayWindow;
use crate::contribution::contribution;
use crate::models::{CaseRecord, CounterDelta, CounterVector};
use crate::scope::Scope;
use crate::store::{diff_windows, ChangeKind, DocumentChange, FeedEvent};
use crate::window_cache::WindowCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Seeding,
    Reconciling,
}

/// Per-session reconciliation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileStats {
    /// Records placed in the cache by the seeding delivery.
    pub seeded: u64,
    pub added: u64,
    pub modified: u64,
    pub removed: u64,
    /// Changes that carried nothing to apply.
    pub ignored: u64,
    /// Counter updates that would have gone negative.
    pub clamped: u64,
    /// Changes that look like window-boundary crossings rather than real events.
    pub boundary_suspects: u64,
}

pub struct Reconciler {
    scope: Arc<Scope>,
    today: TodayWindow,
    counters: CounterVector,
    cache: WindowCache,
    phase: Phase,
    stats: ReconcileStats,
}

impl Reconciler {
    /// Start from the aggregate produced by the Initial Aggregator.
    pub fn new(scope: Arc<Scope>, today: TodayWindow, counters: CounterVector, window_size: usize) -> Self {
        Self {
            scope,
            today,
            counters,
            cache: WindowCache::new(window_size),
            phase: Phase::Seeding,
            stats: ReconcileStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn counters(&self) -> &CounterVector {
        &self.counters
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    pub fn cache(&self) -> &WindowCache {
        &self.cache
    }

    pub fn today(&self) -> &TodayWindow {
        &self.today
    }

    /// Apply one delivery. Returns true if the counter vector changed.
    pub fn apply(&mut self, event: FeedEvent) -> bool {
        match self.phase {
            Phase::Seeding => {
                self.seed(event);
                false
            }
            Phase::Reconciling => {
                let changes = match event {
                    FeedEvent::Changes(changes) => changes,
                    FeedEvent::Snapshot(records) => self.diff_snapshot(&records),
                };
                self.apply_changes(changes)
            }
        }
    }

    // ── Seeding ──────────────────────────────────────────

    fn seed(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Snapshot(records) => self.cache.seed(records),
            FeedEvent::Changes(changes) => {
                let records = changes
                    .into_iter()
                    .filter(|c| c.kind != ChangeKind::Removed)
                    .filter_map(|c| c.record);
                self.cache.seed(records);
            }
        }
        self.stats.seeded = self.cache.len() as u64;
        self.phase = Phase::Reconciling;
        tracing::debug!(
            scope = %self.scope.key(),
            seeded = self.stats.seeded,
            "Window cache seeded"
        );
    }

    /// A full snapshot mid-session is reduced to the changes it implies.
    fn diff_snapshot(&self, records: &[CaseRecord]) -> Vec<DocumentChange> {
        let cached: Vec<CaseRecord> = self.cache.records_sorted().into_iter().cloned().collect();
        diff_windows(&cached, records)
    }

    // ── Reconciling ──────────────────────────────────────

    fn apply_changes(&mut self, changes: Vec<DocumentChange>) -> bool {
        let received = changes.len();
        let mut net = CounterDelta::zero();

        for change in changes {
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    let Some(record) = change.record else {
                        tracing::warn!(id = %change.id, kind = ?change.kind, "Change without record payload ignored");
                        self.stats.ignored += 1;
                        continue;
                    };
                    net += self.upsert(change.kind, record);
                }
                ChangeKind::Removed => match self.remove(&change.id) {
                    Some(delta) => net += delta,
                    None => self.stats.ignored += 1,
                },
            }
        }

        tracing::debug!(scope = %self.scope.key(), received, cached = self.cache.len(), "Change list applied");

        if net.is_zero() {
            return false;
        }
        for clamp in self.counters.apply(&net) {
            self.stats.clamped += 1;
            tracing::warn!(
                scope = %self.scope.key(),
                counter = %clamp.counter,
                attempted = clamp.attempted,
                "Counter clamped at zero, a delta was missed or applied twice"
            );
        }
        true
    }

    /// `added` for a cached id and `modified` share this path: subtract the
    /// cached state, add the new one. An uncached id is counted as new.
    fn upsert(&mut self, kind: ChangeKind, record: CaseRecord) -> CounterDelta {
        let new = contribution(&record, &self.today, &self.scope);

        if !self.cache.contains(&record.id) && self.is_boundary_entry(&record) {
            self.stats.boundary_suspects += 1;
            tracing::debug!(
                scope = %self.scope.key(),
                id = %record.id,
                kind = ?kind,
                "Record entered window from below, counted as new"
            );
        }

        match self.cache.upsert(record) {
            Some(previous) => {
                self.stats.modified += 1;
                new - contribution(&previous, &self.today, &self.scope)
            }
            None => {
                self.stats.added += 1;
                new
            }
        }
    }

    fn remove(&mut self, id: &str) -> Option<CounterDelta> {
        let scrolled_out = self.cache.is_full()
            && self
                .cache
                .get(id)
                .is_some_and(|r| Some(r.created_at) == self.cache.oldest_created_at());

        let previous = self.cache.remove(id)?;
        if scrolled_out {
            self.stats.boundary_suspects += 1;
            tracing::debug!(scope = %self.scope.key(), id, "Oldest record left a full window, subtracted");
        }
        self.stats.removed += 1;
        Some(-contribution(&previous, &self.today, &self.scope))
    }

    /// A new id older than the newest cached record did not just get created.
    fn is_boundary_entry(&self, record: &CaseRecord) -> bool {
        self.cache
            .newest_created_at()
            .is_some_and(|newest| record.created_at < newest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Counter;
    use crate::scope::{resolve_scope, Caller, ClinicDirectory, Role};
    use crate::store::ClinicInfo;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, hour, minute, 0).unwrap()
    }

    fn today() -> TodayWindow {
        TodayWindow::containing(at(12, 0), 0)
    }

    fn clinics() -> Arc<ClinicDirectory> {
        Arc::new(ClinicDirectory::from_entries([
            ClinicInfo {
                clinic_id: "k1".into(),
                partner_name: "Acme".into(),
                clinic_code: None,
            },
            ClinicInfo {
                clinic_id: "k2".into(),
                partner_name: "Globex".into(),
                clinic_code: None,
            },
        ]))
    }

    fn admin_scope() -> Arc<Scope> {
        Arc::new(resolve_scope(&Caller::new(Role::Admin, "root"), clinics()).unwrap())
    }

    fn reconciler(window: usize) -> Reconciler {
        Reconciler::new(admin_scope(), today(), CounterVector::default(), window)
    }

    fn case(id: &str, minute: u32) -> CaseRecord {
        CaseRecord::new(id, at(9, minute))
    }

    fn seeded(window: usize, records: Vec<CaseRecord>) -> Reconciler {
        let mut r = reconciler(window);
        r.apply(FeedEvent::Snapshot(records));
        r
    }

    #[test]
    fn seeding_never_touches_counters() {
        let mut initial = CounterVector::default();
        initial.total_cases = 2;
        initial.doctor_pending_cases = 2;
        let mut r = Reconciler::new(admin_scope(), today(), initial, 10);

        let changed = r.apply(FeedEvent::Snapshot(vec![case("a", 1), case("b", 2)]));

        assert!(!changed);
        assert_eq!(*r.counters(), initial);
        assert_eq!(r.phase(), Phase::Reconciling);
        assert_eq!(r.cache().len(), 2);
        assert_eq!(r.stats().seeded, 2);
    }

    #[test]
    fn seeding_from_change_list() {
        let mut r = reconciler(10);
        r.apply(FeedEvent::Changes(vec![
            DocumentChange::added(case("a", 1)),
            DocumentChange::removed("zzz"),
        ]));
        assert_eq!(r.phase(), Phase::Reconciling);
        assert!(r.cache().contains("a"));
        assert!(r.counters().total_cases == 0);
    }

    #[test]
    fn seeding_is_idempotent_for_narrowed_scopes() {
        let mut acme = case("acme", 1);
        acme.clinic_id = Some("k1".into());
        acme.assigned_doctor = Some("doc-1".into());
        let mut globex = case("globex", 2);
        globex.clinic_id = Some("k2".into());
        globex.assigned_doctor = Some("doc-1".into());
        let mut stranger = case("stranger", 3);
        stranger.clinic_id = Some("k1".into());
        stranger.assigned_doctor = Some("doc-2".into());
        let window = vec![stranger.clone(), globex.clone(), acme.clone()];

        for caller in [
            Caller::new(Role::Partner, "p").with_partner("Acme"),
            Caller::new(Role::Doctor, "doc-1").with_partner("Acme"),
            Caller::new(Role::Doctor, "doc-1"),
        ] {
            let scope = Arc::new(resolve_scope(&caller, clinics()).unwrap());
            let initial = window
                .iter()
                .fold(CounterDelta::zero(), |acc, r| acc + contribution(r, &today(), &scope));
            let mut seeded_vector = CounterVector::default();
            seeded_vector.apply(&initial);

            let mut r = Reconciler::new(Arc::clone(&scope), today(), seeded_vector, 10);
            assert!(!r.apply(FeedEvent::Snapshot(window.clone())), "{}", scope.key());
            assert_eq!(*r.counters(), seeded_vector, "{}", scope.key());
            assert_eq!(r.stats().seeded, 3);

            // re-delivering the same window is a no-op
            assert!(!r.apply(FeedEvent::Snapshot(window.clone())));
            assert_eq!(*r.counters(), seeded_vector);
        }
    }

    #[test]
    fn new_record_scenario() {
        let mut r = seeded(10, vec![]);
        assert!(r.apply(FeedEvent::Changes(vec![DocumentChange::added(case("a", 1))])));

        let c = r.counters();
        assert_eq!(c.total_cases, 1);
        assert_eq!(c.doctor_pending_cases, 1);
        assert_eq!(c.pending_cases(), 1);
        assert_eq!(c.completed_cases + c.pharmacist_pending_cases + c.incomplete_cases, 0);
    }

    #[test]
    fn completion_transition_scenario() {
        let mut r = seeded(10, vec![]);
        r.apply(FeedEvent::Changes(vec![DocumentChange::added(case("a", 1))]));

        let mut signed = case("a", 1);
        signed.doctor_completed = true;
        r.apply(FeedEvent::Changes(vec![DocumentChange::modified(signed)]));

        let c = r.counters();
        assert_eq!(c.doctor_pending_cases, 0);
        assert_eq!(c.pharmacist_pending_cases, 1);
        assert_eq!(c.pending_cases(), 1);
        assert_eq!(c.total_cases, 1);
        assert_eq!(r.stats().modified, 1);
    }

    #[test]
    fn bundled_record_scenario() {
        let mut r = seeded(10, vec![]);
        let mut bundle = case("b", 5);
        bundle.emr_numbers = vec!["A".into(), "B".into(), "C".into()];
        bundle.doctor_completed = true;
        bundle.pharmacist_completed = true;
        bundle.completed_at = Some(at(10, 0));
        r.apply(FeedEvent::Changes(vec![DocumentChange::added(bundle)]));

        let c = r.counters();
        assert_eq!(c.total_cases, 3);
        assert_eq!(c.completed_cases, 3);
        assert_eq!(c.today_cases, 3);
        assert_eq!(c.today_completed, 3);
    }

    #[test]
    fn out_of_scope_record_scenario() {
        let scope = Arc::new(
            resolve_scope(&Caller::new(Role::Partner, "p").with_partner("Acme"), clinics()).unwrap(),
        );
        let mut r = Reconciler::new(scope, today(), CounterVector::default(), 10);
        r.apply(FeedEvent::Snapshot(vec![]));

        let mut foreign = case("x", 1);
        foreign.clinic_id = Some("k2".into());
        let changed = r.apply(FeedEvent::Changes(vec![DocumentChange::added(foreign)]));

        assert!(!changed);
        assert_eq!(*r.counters(), CounterVector::default());
    }

    #[test]
    fn modified_uncached_counts_as_added() {
        let mut r = seeded(10, vec![]);
        r.apply(FeedEvent::Changes(vec![DocumentChange::modified(case("a", 1))]));
        assert_eq!(r.counters().total_cases, 1);
        assert_eq!(r.stats().added, 1);
        assert!(r.cache().contains("a"));
    }

    #[test]
    fn added_for_cached_id_is_a_modification() {
        let mut r = seeded(10, vec![case("a", 1)]);
        let mut initial = *r.counters();
        initial.total_cases = 1;
        initial.doctor_pending_cases = 1;
        r.counters = initial;

        let mut done = case("a", 1);
        done.doctor_completed = true;
        r.apply(FeedEvent::Changes(vec![DocumentChange::added(done)]));

        assert_eq!(r.counters().total_cases, 1, "no double count");
        assert_eq!(r.counters().pharmacist_pending_cases, 1);
        assert_eq!(r.counters().doctor_pending_cases, 0);
    }

    #[test]
    fn removed_cached_record_is_subtracted() {
        let mut r = seeded(10, vec![]);
        r.apply(FeedEvent::Changes(vec![DocumentChange::added(case("a", 1))]));
        r.apply(FeedEvent::Changes(vec![DocumentChange::removed("a")]));

        assert_eq!(*r.counters(), CounterVector::default());
        assert!(r.cache().is_empty());
        assert_eq!(r.stats().removed, 1);
    }

    #[test]
    fn removed_uncached_is_ignored() {
        let mut r = seeded(10, vec![]);
        assert!(!r.apply(FeedEvent::Changes(vec![DocumentChange::removed("ghost")])));
        assert_eq!(r.stats().ignored, 1);
    }

    #[test]
    fn change_without_payload_is_ignored() {
        let mut r = seeded(10, vec![]);
        let hollow = DocumentChange {
            kind: ChangeKind::Modified,
            id: "a".into(),
            record: None,
        };
        assert!(!r.apply(FeedEvent::Changes(vec![hollow])));
        assert_eq!(r.stats().ignored, 1);
    }

    #[test]
    fn negative_counter_is_clamped_and_flagged() {
        // Seeded record was never part of the aggregate (counters all zero).
        let mut r = seeded(10, vec![case("a", 1)]);
        r.apply(FeedEvent::Changes(vec![DocumentChange::removed("a")]));

        assert_eq!(r.counters().total_cases, 0);
        assert_eq!(r.counters().doctor_pending_cases, 0);
        assert_eq!(r.stats().clamped, 2);
    }

    #[test]
    fn changes_apply_in_delivery_order() {
        let mut r = seeded(10, vec![]);
        let mut done = case("a", 1);
        done.doctor_completed = true;
        done.pharmacist_completed = true;
        r.apply(FeedEvent::Changes(vec![
            DocumentChange::added(case("a", 1)),
            DocumentChange::modified(done),
        ]));

        assert_eq!(r.counters().total_cases, 1);
        assert_eq!(r.counters().completed_cases, 1);
        assert_eq!(r.counters().doctor_pending_cases, 0);
    }

    #[test]
    fn boundary_crossings_are_counted_and_flagged() {
        let mut r = seeded(2, vec![case("b", 2), case("c", 3)]);
        r.counters.total_cases = 3;
        r.counters.doctor_pending_cases = 3;

        // "c" deleted; older "a" scrolls back in from below the window
        r.apply(FeedEvent::Changes(vec![
            DocumentChange::removed("c"),
            DocumentChange::added(case("a", 1)),
        ]));
        assert_eq!(r.stats().boundary_suspects, 1);
        assert_eq!(r.counters().total_cases, 3, "approximation: re-entry counted again");

        // newer "d" arrives and pushes oldest "a" out
        r.apply(FeedEvent::Changes(vec![
            DocumentChange::removed("a"),
            DocumentChange::added(case("d", 4)),
        ]));
        assert_eq!(r.stats().boundary_suspects, 2);
        assert_eq!(r.counters().total_cases, 3);
    }

    #[test]
    fn mid_session_snapshot_is_diffed() {
        let mut r = seeded(10, vec![case("a", 1)]);
        r.counters.total_cases = 1;
        r.counters.doctor_pending_cases = 1;

        let mut done = case("a", 1);
        done.doctor_completed = true;
        r.apply(FeedEvent::Snapshot(vec![case("b", 2), done]));

        assert_eq!(r.counters().total_cases, 2);
        assert_eq!(r.counters().doctor_pending_cases, 1);
        assert_eq!(r.counters().pharmacist_pending_cases, 1);
    }

    #[test]
    fn delta_symmetry_matches_recompute() {
        let today = today();
        let scope = admin_scope();
        let mut a = case("a", 1);
        a.emr_numbers = vec!["x".into(), "y".into()];
        let mut b = a.clone();
        b.is_incomplete = true;
        b.completed_at = Some(at(11, 0));
        let other = case("o", 2);

        let mut incremental = CounterVector::default();
        incremental.apply(&(contribution(&a, &today, &scope) + contribution(&other, &today, &scope)));
        incremental.apply(&(contribution(&b, &today, &scope) - contribution(&a, &today, &scope)));

        let mut recomputed = CounterVector::default();
        recomputed.apply(&(contribution(&b, &today, &scope) + contribution(&other, &today, &scope)));

        assert_eq!(incremental, recomputed);
        assert_eq!(recomputed.get(Counter::TodayIncomplete), 2);
    }
}
