pub mod config;
pub mod clock;
pub mod models;
pub mod store; // CaseStore seam + bundled memory/SQLite backends
pub mod scope; // Access Scope Resolver
pub mod contribution; // Contribution Calculator
pub mod aggregator; // Initial Aggregator
pub mod window_cache;
pub mod reconcile; // Reconciliation state machine
pub mod counter_store; // Observable counter state
pub mod engine;

use tracing_subscriber::EnvFilter;

pub use aggregator::{AggregationError, InitialAggregator};
pub use clock::{Clock, FixedClock, SystemClock, TodayWindow};
pub use config::EngineConfig;
pub use contribution::contribution;
pub use counter_store::{CounterState, CounterStore, LoadingState};
pub use engine::{CounterEngine, EngineError};
pub use models::{CaseRecord, Counter, CounterDelta, CounterVector};
pub use reconcile::{ReconcileStats, Reconciler};
pub use scope::{resolve_scope, Caller, ClinicDirectory, Role, Scope, ScopeError, ScopeKey};
pub use store::{CaseFilter, CaseStore, ClinicInfo, MemoryCaseStore, SqliteCaseStore, StoreError};
pub use window_cache::WindowCache;

/// Install the global tracing subscriber.
///
/// Safe to call more than once: later calls are no-ops.
pub fn init_tracing() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("{} v{} tracing initialized", config::APP_NAME, config::APP_VERSION);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
