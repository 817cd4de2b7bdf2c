//! Aggregate counters and the signed deltas applied to them.

use std::ops::{Add, AddAssign, Neg, Sub};

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

// ═══════════════════════════════════════════════════════════
// Counter
// ═══════════════════════════════════════════════════════════

/// The stored counters. `pendingCases` is derived and deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Counter {
    TotalCases,
    CompletedCases,
    DoctorPendingCases,
    PharmacistPendingCases,
    IncompleteCases,
    TodayCases,
    TodayCompleted,
    TodayIncomplete,
}

impl Counter {
    pub const COUNT: usize = 8;

    pub const ALL: [Counter; Counter::COUNT] = [
        Counter::TotalCases,
        Counter::CompletedCases,
        Counter::DoctorPendingCases,
        Counter::PharmacistPendingCases,
        Counter::IncompleteCases,
        Counter::TodayCases,
        Counter::TodayCompleted,
        Counter::TodayIncomplete,
    ];

    fn index(self) -> usize {
        match self {
            Self::TotalCases => 0,
            Self::CompletedCases => 1,
            Self::DoctorPendingCases => 2,
            Self::PharmacistPendingCases => 3,
            Self::IncompleteCases => 4,
            Self::TodayCases => 5,
            Self::TodayCompleted => 6,
            Self::TodayIncomplete => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TotalCases => "totalCases",
            Self::CompletedCases => "completedCases",
            Self::DoctorPendingCases => "doctorPendingCases",
            Self::PharmacistPendingCases => "pharmacistPendingCases",
            Self::IncompleteCases => "incompleteCases",
            Self::TodayCases => "todayCases",
            Self::TodayCompleted => "todayCompleted",
            Self::TodayIncomplete => "todayIncomplete",
        }
    }
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════
// CounterDelta
// ═══════════════════════════════════════════════════════════

/// Signed per-counter change. Every counter is always present (zero by default).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta([i64; Counter::COUNT]);

impl CounterDelta {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: Counter) -> i64 {
        self.0[counter.index()]
    }

    pub fn increment(&mut self, counter: Counter, n: i64) {
        self.0[counter.index()] += n;
    }

    /// Builder form of `increment`.
    pub fn with(mut self, counter: Counter, n: i64) -> Self {
        self.increment(counter, n);
        self
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0)
    }

    /// Non-zero entries in counter order.
    pub fn entries(&self) -> impl Iterator<Item = (Counter, i64)> + '_ {
        Counter::ALL
            .iter()
            .map(|c| (*c, self.get(*c)))
            .filter(|(_, v)| *v != 0)
    }
}

impl Add for CounterDelta {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl AddAssign for CounterDelta {
    fn add_assign(&mut self, rhs: Self) {
        for (lhs, rhs) in self.0.iter_mut().zip(rhs.0) {
            *lhs += rhs;
        }
    }
}

impl Neg for CounterDelta {
    type Output = Self;

    fn neg(mut self) -> Self {
        for v in self.0.iter_mut() {
            *v = -*v;
        }
        self
    }
}

impl Sub for CounterDelta {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self + (-rhs)
    }
}

// ═══════════════════════════════════════════════════════════
// CounterVector
// ═══════════════════════════════════════════════════════════

/// A counter that would have gone negative and was held at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClampedCounter {
    pub counter: Counter,
    pub attempted: i64,
}

/// Live aggregate counters. Values never go below zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterVector {
    pub total_cases: u64,
    pub completed_cases: u64,
    pub doctor_pending_cases: u64,
    pub pharmacist_pending_cases: u64,
    pub incomplete_cases: u64,
    pub today_cases: u64,
    pub today_completed: u64,
    pub today_incomplete: u64,
}

impl CounterVector {
    /// Always recomputed from the two role-specific pending counters.
    pub fn pending_cases(&self) -> u64 {
        self.doctor_pending_cases + self.pharmacist_pending_cases
    }

    pub fn get(&self, counter: Counter) -> u64 {
        match counter {
            Counter::TotalCases => self.total_cases,
            Counter::CompletedCases => self.completed_cases,
            Counter::DoctorPendingCases => self.doctor_pending_cases,
            Counter::PharmacistPendingCases => self.pharmacist_pending_cases,
            Counter::IncompleteCases => self.incomplete_cases,
            Counter::TodayCases => self.today_cases,
            Counter::TodayCompleted => self.today_completed,
            Counter::TodayIncomplete => self.today_incomplete,
        }
    }

    pub fn set(&mut self, counter: Counter, value: u64) {
        let slot = match counter {
            Counter::TotalCases => &mut self.total_cases,
            Counter::CompletedCases => &mut self.completed_cases,
            Counter::DoctorPendingCases => &mut self.doctor_pending_cases,
            Counter::PharmacistPendingCases => &mut self.pharmacist_pending_cases,
            Counter::IncompleteCases => &mut self.incomplete_cases,
            Counter::TodayCases => &mut self.today_cases,
            Counter::TodayCompleted => &mut self.today_completed,
            Counter::TodayIncomplete => &mut self.today_incomplete,
        };
        *slot = value;
    }

    /// Apply a signed delta, clamping any counter that would go negative.
    ///
    /// Returns the clamped counters; a non-empty result means a delta was
    /// missed or applied twice somewhere upstream.
    pub fn apply(&mut self, delta: &CounterDelta) -> Vec<ClampedCounter> {
        let mut clamped = Vec::new();
        for (counter, change) in delta.entries() {
            let next = self.get(counter) as i64 + change;
            if next < 0 {
                clamped.push(ClampedCounter {
                    counter,
                    attempted: next,
                });
                self.set(counter, 0);
            } else {
                self.set(counter, next as u64);
            }
        }
        clamped
    }
}

impl Serialize for CounterVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("CounterVector", Counter::COUNT + 1)?;
        s.serialize_field("totalCases", &self.total_cases)?;
        s.serialize_field("completedCases", &self.completed_cases)?;
        s.serialize_field("doctorPendingCases", &self.doctor_pending_cases)?;
        s.serialize_field("pharmacistPendingCases", &self.pharmacist_pending_cases)?;
        s.serialize_field("pendingCases", &self.pending_cases())?;
        s.serialize_field("incompleteCases", &self.incomplete_cases)?;
        s.serialize_field("todayCases", &self.today_cases)?;
        s.serialize_field("todayCompleted", &self.today_completed)?;
        s.serialize_field("todayIncomplete", &self.today_incomplete)?;
        s.end()
    }
}
