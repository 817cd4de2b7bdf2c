//! Exact initial aggregation.
//!
//! One store round trip per counter, all eight issued concurrently. Each
//! query is narrowed server-side by the scope's owner filter plus the
//! counter's status predicate; partner filtering and sub-unit summing
//! happen client-side. The vector is only returned once every round trip
//! has succeeded.

use std::sync::Arc;

use futures_util::future::try_join_all;

use crate::clock::TodayWindow;
use crate::models::{Counter, CounterVector};
use crate::scope::Scope;
use crate::store::{CaseFilter, CaseStore, StoreError};

pub struct InitialAggregator<S> {
    store: Arc<S>,
    scope: Arc<Scope>,
}

impl<S: CaseStore> InitialAggregator<S> {
    pub fn new(store: Arc<S>, scope: Arc<Scope>) -> Self {
        Self { store, scope }
    }

    /// Compute the full counter vector for the scope.
    ///
    /// All-or-nothing: the first failing round trip aborts the whole
    /// aggregation and the remaining queries are dropped.
    pub async fn aggregate(&self, today: &TodayWindow) -> Result<CounterVector, AggregationError> {
        let base = self.scope.server_filter();
        let queries = Counter::ALL.iter().map(|&counter| {
            let filter = counter_filter(counter, &base, today);
            async move {
                let units = self.count(&filter).await.map_err(|source| {
                    tracing::warn!(
                        scope = %self.scope.key(),
                        counter = %counter,
                        error = %source,
                        "Aggregation round trip failed"
                    );
                    AggregationError::Query { counter, source }
                })?;
                Ok::<_, AggregationError>((counter, units))
            }
        });

        let results = try_join_all(queries).await?;

        let mut vector = CounterVector::default();
        for (counter, units) in results {
            vector.set(counter, units);
        }

        tracing::info!(
            scope = %self.scope.key(),
            total = vector.total_cases,
            completed = vector.completed_cases,
            pending = vector.pending_cases(),
            incomplete = vector.incomplete_cases,
            today_completed = vector.today_completed,
            "Initial aggregation complete"
        );
        Ok(vector)
    }

    /// Sum of sub-units over the scope-included records matching `filter`.
    async fn count(&self, filter: &CaseFilter) -> Result<u64, StoreError> {
        let records = self.store.fetch(filter).await?;
        Ok(records
            .iter()
            .filter(|r| self.scope.includes(r))
            .map(|r| r.sub_unit_count())
            .sum())
    }
}

/// Store query for one counter. Mirrors the priority order used by the
/// contribution calculator, so both sources bucket every record identically.
pub fn counter_filter(counter: Counter, base: &CaseFilter, today: &TodayWindow) -> CaseFilter {
    let completed = || base.clone().incomplete(false).doctor_completed(true).pharmacist_completed(true);
    match counter {
        Counter::TotalCases => base.clone(),
        Counter::IncompleteCases => base.clone().incomplete(true),
        Counter::CompletedCases => completed(),
        Counter::DoctorPendingCases => base.clone().incomplete(false).doctor_completed(false),
        Counter::PharmacistPendingCases => base
            .clone()
            .incomplete(false)
            .doctor_completed(true)
            .pharmacist_completed(false),
        Counter::TodayIncomplete => base.clone().incomplete(true).completed_between(today.start, today.end),
        Counter::TodayCases | Counter::TodayCompleted => completed().completed_between(today.start, today.end),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("Counts unavailable: {counter} query failed: {source}")]
    Query {
        counter: Counter,
        #[source]
        source: StoreError,
    },
}
