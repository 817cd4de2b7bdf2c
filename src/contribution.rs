//! Per-record contribution to the aggregate counters.
//!
//! Pure and deterministic: the same record, day window and scope always
//! yield the same vector. The Reconciler turns every change into
//! `contribution(new) - contribution(old)`.

use crate::clock::TodayWindow;
use crate::models::{CaseRecord, Counter, CounterDelta};
use crate::scope::Scope;

/// Lifecycle bucket a record falls into. Exactly one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseStatus {
    Incomplete,
    Completed,
    DoctorPending,
    PharmacistPending,
}

impl CaseStatus {
    /// Priority order: incomplete, completed, doctor pending, pharmacist pending.
    pub fn of(record: &CaseRecord) -> Self {
        if record.is_incomplete {
            Self::Incomplete
        } else if record.is_completed() {
            Self::Completed
        } else if !record.doctor_completed {
            Self::DoctorPending
        } else {
            Self::PharmacistPending
        }
    }
}

/// Counter vector one record adds to the aggregate for `scope`.
pub fn contribution(record: &CaseRecord, today: &TodayWindow, scope: &Scope) -> CounterDelta {
    if scope.excludes(record) {
        return CounterDelta::zero();
    }
    classify(record, today)
}

/// Scope-free classification.
pub fn classify(record: &CaseRecord, today: &TodayWindow) -> CounterDelta {
    let n = record.sub_unit_count() as i64;
    let finished_today = record.completed_at.is_some_and(|at| today.contains(at));

    let mut delta = CounterDelta::zero().with(Counter::TotalCases, n);
    match CaseStatus::of(record) {
        CaseStatus::Incomplete => {
            delta.increment(Counter::IncompleteCases, n);
            if finished_today {
                delta.increment(Counter::TodayIncomplete, n);
            }
        }
        CaseStatus::Completed => {
            delta.increment(Counter::CompletedCases, n);
            if finished_today {
                delta.increment(Counter::TodayCases, n);
                delta.increment(Counter::TodayCompleted, n);
            }
        }
        CaseStatus::DoctorPending => delta.increment(Counter::DoctorPendingCases, n),
        CaseStatus::PharmacistPending => delta.increment(Counter::PharmacistPendingCases, n),
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{resolve_scope, Caller, ClinicDirectory, Role};
    use crate::store::ClinicInfo;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn today() -> TodayWindow {
        TodayWindow::containing(at(10, 12), 0)
    }

    fn admin() -> Scope {
        resolve_scope(&Caller::new(Role::Admin, "root"), Arc::new(ClinicDirectory::default())).unwrap()
    }

    fn case() -> CaseRecord {
        CaseRecord::new("c1", at(10, 8))
    }

    #[test]
    fn pending_doctor_counts_total_and_doctor_pending() {
        let delta = contribution(&case(), &today(), &admin());
        let expected = CounterDelta::zero()
            .with(Counter::TotalCases, 1)
            .with(Counter::DoctorPendingCases, 1);
        assert_eq!(delta, expected);
    }

    #[test]
    fn pharmacist_pending_after_doctor_signs() {
        let mut r = case();
        r.doctor_completed = true;
        assert_eq!(CaseStatus::of(&r), CaseStatus::PharmacistPending);
        assert_eq!(contribution(&r, &today(), &admin()).get(Counter::PharmacistPendingCases), 1);
    }

    #[test]
    fn completed_today_feeds_today_counters() {
        let mut r = case();
        r.doctor_completed = true;
        r.pharmacist_completed = true;
        r.completed_at = Some(at(10, 11));
        r.emr_numbers = vec!["A".into(), "B".into(), "C".into()];

        let delta = contribution(&r, &today(), &admin());
        assert_eq!(delta.get(Counter::TotalCases), 3);
        assert_eq!(delta.get(Counter::CompletedCases), 3);
        assert_eq!(delta.get(Counter::TodayCases), 3);
        assert_eq!(delta.get(Counter::TodayCompleted), 3);
        assert_eq!(delta.get(Counter::DoctorPendingCases), 0);
    }

    #[test]
    fn completed_yesterday_skips_today_counters() {
        let mut r = case();
        r.doctor_completed = true;
        r.pharmacist_completed = true;
        r.completed_at = Some(at(9, 23));

        let delta = classify(&r, &today());
        assert_eq!(delta.get(Counter::CompletedCases), 1);
        assert_eq!(delta.get(Counter::TodayCompleted), 0);
        assert_eq!(delta.get(Counter::TodayCases), 0);
    }

    #[test]
    fn incomplete_takes_priority_over_completion_flags() {
        let mut r = case();
        r.is_incomplete = true;
        r.doctor_completed = true;
        r.pharmacist_completed = true;
        r.completed_at = Some(at(10, 9));

        let delta = classify(&r, &today());
        let expected = CounterDelta::zero()
            .with(Counter::TotalCases, 1)
            .with(Counter::IncompleteCases, 1)
            .with(Counter::TodayIncomplete, 1);
        assert_eq!(delta, expected);
    }

    #[test]
    fn completion_at_window_end_is_tomorrow() {
        let mut r = case();
        r.doctor_completed = true;
        r.pharmacist_completed = true;
        r.completed_at = Some(today().end);
        assert_eq!(classify(&r, &today()).get(Counter::TodayCompleted), 0);

        r.completed_at = Some(today().start);
        assert_eq!(classify(&r, &today()).get(Counter::TodayCompleted), 1);
    }

    #[test]
    fn excluded_record_contributes_nothing() {
        let clinics = Arc::new(ClinicDirectory::from_entries([ClinicInfo {
            clinic_id: "k1".into(),
            partner_name: "Acme".into(),
            clinic_code: None,
        }]));
        let scope = resolve_scope(&Caller::new(Role::Partner, "p").with_partner("Globex"), clinics).unwrap();
        let mut r = case();
        r.clinic_id = Some("k1".into());

        assert!(contribution(&r, &today(), &scope).is_zero());
    }

    #[test]
    fn transition_delta_moves_units_between_buckets() {
        let before = case();
        let mut after = case();
        after.doctor_completed = true;
        after.pharmacist_completed = true;
        after.completed_at = Some(at(10, 10));

        let delta = classify(&after, &today()) - classify(&before, &today());
        let expected = CounterDelta::zero()
            .with(Counter::DoctorPendingCases, -1)
            .with(Counter::CompletedCases, 1)
            .with(Counter::TodayCases, 1)
            .with(Counter::TodayCompleted, 1);
        assert_eq!(delta, expected);
    }
}
