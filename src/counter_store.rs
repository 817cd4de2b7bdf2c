//! Observable counter state for the UI layer.
//!
//! Backed by a `tokio::sync::watch` channel: readers always see a complete
//! `CounterState` (never a half-applied vector) and can await changes.
//! Every session publishes under a generation number; publishes from any
//! generation other than the current one are dropped.

use serde::Serialize;
use tokio::sync::watch;

use crate::models::CounterVector;
use crate::reconcile::ReconcileStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadingState {
    Unsubscribed,
    Seeding,
    Reconciling,
    Error,
}

/// Snapshot of everything a reader needs to render the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterState {
    pub generation: u64,
    /// Key of the scope these counters belong to.
    pub scope: Option<String>,
    pub loading: LoadingState,
    /// `None` while loading a fresh scope or when counts are unavailable.
    pub counters: Option<CounterVector>,
    pub stats: ReconcileStats,
    pub error: Option<String>,
    pub consecutive_failures: u32,
}

impl Default for CounterState {
    fn default() -> Self {
        Self {
            generation: 0,
            scope: None,
            loading: LoadingState::Unsubscribed,
            counters: None,
            stats: ReconcileStats::default(),
            error: None,
            consecutive_failures: 0,
        }
    }
}

pub struct CounterStore {
    tx: watch::Sender<CounterState>,
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CounterState::default());
        Self { tx }
    }

    pub fn watch(&self) -> watch::Receiver<CounterState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> CounterState {
        self.tx.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.tx.borrow().generation
    }

    /// Open a new generation for `scope_key` with the loading sentinel.
    pub fn begin(&self, scope_key: &str) -> u64 {
        let mut next = 0;
        self.tx.send_modify(|state| {
            next = state.generation + 1;
            *state = CounterState {
                generation: next,
                scope: Some(scope_key.to_string()),
                loading: LoadingState::Seeding,
                ..CounterState::default()
            };
        });
        next
    }

    /// Invalidate every session and go back to `Unsubscribed`.
    pub fn reset(&self) -> u64 {
        let mut next = 0;
        self.tx.send_modify(|state| {
            next = state.generation + 1;
            *state = CounterState {
                generation: next,
                ..CounterState::default()
            };
        });
        next
    }

    /// Mutate the state if `generation` is still current.
    ///
    /// Returns false (and leaves the state untouched) for stale publishers.
    pub fn publish<F>(&self, generation: u64, update: F) -> bool
    where
        F: FnOnce(&mut CounterState),
    {
        self.tx.send_if_modified(|state| {
            if state.generation != generation {
                return false;
            }
            let before = state.clone();
            update(state);
            *state != before
        })
    }
}
