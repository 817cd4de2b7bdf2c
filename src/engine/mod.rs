//! Counter engine: the lifecycle surface exposed to the UI layer.
//!
//! `set_scope` and `teardown` are the only mutating calls. A scope change
//! stops the previous session (cancelling in-flight aggregation and closing
//! its feed) before a new generation is opened in the `CounterStore`, so no
//! delta from the old scope can reach the new vector.

pub mod session;

use std::sync::Arc;

use tokio::sync::watch;

use crate::aggregator::AggregationError;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::counter_store::{CounterState, CounterStore, LoadingState};
use crate::scope::{resolve_scope, Caller, ClinicDirectory, ScopeError, ScopeKey};
use crate::store::{CaseStore, StoreError};

pub use session::{SessionContext, SessionHandle};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Scope error: {0}")]
    Scope(#[from] ScopeError),

    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("Subscription error: {0}")]
    Subscription(#[source] StoreError),

    #[error("Clinic directory error: {0}")]
    Directory(#[source] StoreError),

    #[error("Change feed disconnected")]
    Disconnected,

    #[error("Counter session task panicked")]
    TaskPanicked,
}

pub struct CounterEngine<S: CaseStore> {
    store: Arc<S>,
    clinics: Arc<ClinicDirectory>,
    counters: Arc<CounterStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    session: Option<SessionHandle>,
}

impl<S: CaseStore> CounterEngine<S> {
    pub fn new(store: Arc<S>, clinics: Arc<ClinicDirectory>, config: EngineConfig) -> Self {
        Self {
            store,
            clinics,
            counters: Arc::new(CounterStore::new()),
            clock: Arc::new(SystemClock),
            config,
            session: None,
        }
    }

    /// Build an engine whose clinic directory is loaded from the store.
    pub async fn load(store: Arc<S>, clinic_ids: &[String], config: EngineConfig) -> Result<Self, EngineError> {
        let clinics = ClinicDirectory::load(store.as_ref(), clinic_ids, config.clinic_lookup_batch)
            .await
            .map_err(EngineError::Directory)?;
        tracing::info!(clinics = clinics.len(), "Counter engine ready");
        Ok(Self::new(store, Arc::new(clinics), config))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clinics(&self) -> &ClinicDirectory {
        &self.clinics
    }

    /// Observe counter state changes.
    pub fn watch(&self) -> watch::Receiver<CounterState> {
        self.counters.watch()
    }

    pub fn state(&self) -> CounterState {
        self.counters.current()
    }

    pub fn active_scope(&self) -> Option<&ScopeKey> {
        self.session.as_ref().map(|s| s.scope_key())
    }

    /// Switch counting to `caller`'s scope.
    ///
    /// A caller resolving to the scope already being counted keeps the
    /// running session, unless that session has given up in `Error`.
    pub async fn set_scope(&mut self, caller: &Caller) -> Result<(), EngineError> {
        let scope = match resolve_scope(caller, Arc::clone(&self.clinics)) {
            Ok(scope) => scope,
            Err(e) => {
                tracing::warn!(role = caller.role.as_str(), error = %e, "Scope rejected, counters torn down");
                self.close_session().await;
                self.counters.reset();
                return Err(e.into());
            }
        };

        if let Some(current) = &self.session {
            let healthy = self.counters.current().loading != LoadingState::Error;
            if current.scope_key() == scope.key() && current.is_running() && healthy {
                tracing::debug!(scope = %scope.key(), "Scope unchanged, keeping session");
                return Ok(());
            }
        }

        self.close_session().await;
        let generation = self.counters.begin(&scope.key().to_string());
        self.session = Some(SessionHandle::open(SessionContext {
            store: Arc::clone(&self.store),
            scope: Arc::new(scope),
            counters: Arc::clone(&self.counters),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            generation,
        }));
        Ok(())
    }

    /// Stop counting and return to `Unsubscribed`.
    pub async fn teardown(&mut self) -> Result<(), EngineError> {
        let result = match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        };
        self.counters.reset();
        tracing::info!("Counter engine torn down");
        result
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                tracing::warn!(error = %e, "Previous counter session ended abnormally");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
