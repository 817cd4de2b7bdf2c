use std::time::Duration;

/// Application-level constants
pub const APP_NAME: &str = "case-counters";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of most-recent cases tracked live by the change feed.
pub const DEFAULT_WINDOW_SIZE: usize = 100;

/// Default clinic ids per batched lookup round trip.
pub const DEFAULT_CLINIC_LOOKUP_BATCH: usize = 30;

const ENV_WINDOW_SIZE: &str = "CASE_COUNTERS_WINDOW_SIZE";
const ENV_UTC_OFFSET: &str = "CASE_COUNTERS_UTC_OFFSET_MINUTES";
const ENV_RECONNECT_DELAY: &str = "CASE_COUNTERS_RECONNECT_DELAY_MS";
const ENV_MAX_RECONNECTS: &str = "CASE_COUNTERS_MAX_RECONNECTS";
const ENV_FEED_POLL: &str = "CASE_COUNTERS_FEED_POLL_MS";

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "case_counters=info"
}

/// Tunables for one counter engine.
///
/// `window_size` is the N of the bounded change feed. Records that cross the
/// window boundary because of collection growth are counted approximately,
/// so a larger N lowers drift at the cost of a bigger live window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub window_size: usize,
    /// Offset from UTC of the local day used for the `today*` counters.
    pub utc_offset_minutes: i32,
    /// Pause before rebuilding a session after a failure.
    pub reconnect_delay: Duration,
    /// Consecutive failed rebuilds tolerated before the session parks in `Error`.
    pub max_reconnect_attempts: u32,
    /// Poll interval for stores that emulate a change feed by polling.
    pub feed_poll_interval: Duration,
    pub clinic_lookup_batch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            utc_offset_minutes: 0,
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 5,
            feed_poll_interval: Duration::from_secs(1),
            clinic_lookup_batch: DEFAULT_CLINIC_LOOKUP_BATCH,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `CASE_COUNTERS_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize, _>(&lookup, ENV_WINDOW_SIZE) {
            if n == 0 {
                tracing::warn!(var = ENV_WINDOW_SIZE, "Window size must be at least 1, keeping default");
            } else {
                config.window_size = n;
            }
        }
        if let Some(offset) = parse_var::<i32, _>(&lookup, ENV_UTC_OFFSET) {
            if offset.abs() < 24 * 60 {
                config.utc_offset_minutes = offset;
            } else {
                tracing::warn!(var = ENV_UTC_OFFSET, offset, "UTC offset out of range, keeping default");
            }
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_RECONNECT_DELAY) {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, ENV_MAX_RECONNECTS) {
            config.max_reconnect_attempts = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_FEED_POLL) {
            if ms == 0 {
                tracing::warn!(var = ENV_FEED_POLL, "Poll interval must be positive, keeping default");
            } else {
                config.feed_poll_interval = Duration::from_millis(ms);
            }
        }

        config
    }

    /// Builder-style override of the window size (clamped to at least 1).
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size.max(1);
        self
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = key, value = %raw, "Ignoring unparseable config value");
            None
        }
    }
}
