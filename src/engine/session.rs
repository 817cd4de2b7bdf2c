//! One counting session: a spawned task that owns a scope's Reconciler.
//!
//! Lifecycle of the task:
//! 1. publish `Seeding`, run the Initial Aggregator, publish its vector
//! 2. open the change feed; the first delivery seeds the Window Cache and
//!    moves the state to `Reconciling`
//! 3. apply deliveries strictly in order until stopped
//!
//! Failures publish `Error` (counters frozen) and the task rebuilds from
//! step 1 after `reconnect_delay`. The end of the local day also triggers
//! a rebuild so the `today*` counters re-baseline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use super::EngineError;
use crate::aggregator::InitialAggregator;
use crate::clock::{Clock, TodayWindow};
use crate::config::EngineConfig;
use crate::counter_store::{CounterStore, LoadingState};
use crate::reconcile::Reconciler;
use crate::scope::{Scope, ScopeKey};
use crate::store::CaseStore;

/// Everything a session task needs. Moved into the task on open.
pub struct SessionContext<S> {
    pub store: Arc<S>,
    pub scope: Arc<Scope>,
    pub counters: Arc<CounterStore>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
    pub generation: u64,
}

/// Handle to a running session task.
///
/// `close` stops the task and waits for it; dropping the handle stops and
/// aborts it. Either way the change feed is released.
pub struct SessionHandle {
    id: Uuid,
    generation: u64,
    scope_key: ScopeKey,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn open<S: CaseStore>(ctx: SessionContext<S>) -> Self {
        let id = Uuid::new_v4();
        let generation = ctx.generation;
        let scope_key = ctx.scope.key().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let span = tracing::info_span!("counter_session", session = %id, scope = %scope_key, generation);
        let task = tokio::spawn(run_session(ctx, shutdown_rx).instrument(span));

        tracing::info!(session = %id, scope = %scope_key, generation, "Counter session started");
        Self {
            id,
            generation,
            scope_key,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn scope_key(&self) -> &ScopeKey {
        &self.scope_key
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the task and wait until it has released its feed.
    pub async fn close(mut self) -> Result<(), EngineError> {
        self.signal_shutdown();
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(()) => {
                tracing::info!(session = %self.id, scope = %self.scope_key, "Counter session closed");
                Ok(())
            }
            Err(e) if e.is_panic() => {
                tracing::error!(session = %self.id, scope = %self.scope_key, "Counter session panicked");
                Err(EngineError::TaskPanicked)
            }
            Err(_) => Ok(()),
        }
    }

    fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.signal_shutdown();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Session task
// ═══════════════════════════════════════════════════════════

enum SessionExit {
    Stopped,
    DayRollover,
    Failed {
        error: EngineError,
        /// The attempt got as far as reconciling before failing.
        reached_reconciling: bool,
    },
}

async fn run_session<S: CaseStore>(ctx: SessionContext<S>, mut shutdown_rx: oneshot::Receiver<()>) {
    let mut failures: u32 = 0;

    loop {
        match run_once(&ctx, &mut shutdown_rx).await {
            SessionExit::Stopped => {
                tracing::debug!("Counter session stopping");
                return;
            }
            SessionExit::DayRollover => {
                tracing::info!("Local day ended, rebuilding counters");
            }
            SessionExit::Failed {
                error,
                reached_reconciling,
            } => {
                if reached_reconciling {
                    failures = 0;
                }
                failures += 1;
                let message = error.to_string();
                ctx.counters.publish(ctx.generation, |state| {
                    state.loading = LoadingState::Error;
                    state.error = Some(message);
                    state.consecutive_failures = failures;
                });

                if failures > ctx.config.max_reconnect_attempts {
                    tracing::error!(failures, error = %error, "Counter session gave up, waiting for a new scope");
                    let _ = (&mut shutdown_rx).await;
                    return;
                }

                tracing::warn!(
                    attempt = failures,
                    delay_ms = ctx.config.reconnect_delay.as_millis() as u64,
                    error = %error,
                    "Counter session failed, rebuilding"
                );
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => return,
                    _ = tokio::time::sleep(ctx.config.reconnect_delay) => {}
                }
            }
        }
    }
}

/// One full build: aggregate, subscribe, reconcile until something ends it.
async fn run_once<S: CaseStore>(ctx: &SessionContext<S>, shutdown_rx: &mut oneshot::Receiver<()>) -> SessionExit {
    let today = TodayWindow::containing(ctx.clock.now(), ctx.config.utc_offset_minutes);
    ctx.counters.publish(ctx.generation, |state| {
        state.loading = LoadingState::Seeding;
        state.error = None;
    });

    let aggregator = InitialAggregator::new(Arc::clone(&ctx.store), Arc::clone(&ctx.scope));
    let initial = tokio::select! {
        biased;
        _ = &mut *shutdown_rx => return SessionExit::Stopped,
        result = aggregator.aggregate(&today) => match result {
            Ok(vector) => vector,
            Err(e) => {
                return SessionExit::Failed {
                    error: e.into(),
                    reached_reconciling: false,
                }
            }
        },
    };
    ctx.counters.publish(ctx.generation, |state| state.counters = Some(initial));

    let filter = ctx.scope.server_filter();
    let mut feed = tokio::select! {
        biased;
        _ = &mut *shutdown_rx => return SessionExit::Stopped,
        result = ctx.store.subscribe(&filter, ctx.config.window_size) => match result {
            Ok(feed) => feed,
            Err(e) => {
                return SessionExit::Failed {
                    error: EngineError::Subscription(e),
                    reached_reconciling: false,
                }
            }
        },
    };

    let mut reconciler = Reconciler::new(Arc::clone(&ctx.scope), today, initial, ctx.config.window_size);
    let mut reconciling = false;

    loop {
        let until_rollover = (today.end - ctx.clock.now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            biased;
            _ = &mut *shutdown_rx => {
                feed.close();
                return SessionExit::Stopped;
            }
            _ = tokio::time::sleep(until_rollover) => {
                if ctx.clock.now() >= today.end {
                    feed.close();
                    return SessionExit::DayRollover;
                }
            }
            item = feed.next() => match item {
                None => {
                    return SessionExit::Failed {
                        error: EngineError::Disconnected,
                        reached_reconciling: reconciling,
                    }
                }
                Some(Err(e)) => {
                    return SessionExit::Failed {
                        error: EngineError::Subscription(e),
                        reached_reconciling: reconciling,
                    }
                }
                Some(Ok(event)) => {
                    let changed = reconciler.apply(event);
                    let first = !reconciling;
                    reconciling = true;
                    ctx.counters.publish(ctx.generation, |state| {
                        state.loading = LoadingState::Reconciling;
                        state.stats = reconciler.stats();
                        if changed {
                            state.counters = Some(*reconciler.counters());
                        }
                        if first {
                            state.consecutive_failures = 0;
                        }
                    });
                }
            }
        }
    }
}
