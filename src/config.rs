/**
 * Tunables for watchers, the reconcile queue and the event bus
 */
use std::time::Duration;
use tracing::warn;

/// Default user agent, overridable via `APPMETA_USER_AGENT`
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Reconcile workers per watcher
pub const DEFAULT_RECONCILE_WORKERS: usize = 1;

/// Attempts per key before it is dropped and reported
pub const MAX_RECONCILE_ATTEMPTS: u32 = 5;

/// First requeue delay in milliseconds, doubled per failure
pub const REQUEUE_BASE_DELAY_MS: u64 = 5;

/// Upper bound for the requeue delay
pub const REQUEUE_MAX_DELAY_SECONDS: u64 = 60;

/// Consecutive watch failures tolerated before the watcher gives up
pub const MAX_WATCH_RESTARTS: u32 = 50;

/// Initial backoff time in seconds between watch restarts
pub const INITIAL_BACKOFF_SECONDS: u64 = 1;

/// Maximum backoff time in seconds between watch restarts
pub const MAX_BACKOFF_SECONDS: u64 = 60;

/// Attempts to hand one event to one listener
pub const LISTENER_DELIVERY_ATTEMPTS: u32 = 5;

const WORKERS_ENV: &str = "APPMETA_RECONCILE_WORKERS";
const ATTEMPTS_ENV: &str = "APPMETA_MAX_RECONCILE_ATTEMPTS";
const RESTARTS_ENV: &str = "APPMETA_MAX_WATCH_RESTARTS";
const USER_AGENT_ENV: &str = "APPMETA_USER_AGENT";

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub workers: usize,
    pub max_reconcile_attempts: u32,
    pub requeue_base_delay: Duration,
    pub requeue_max_delay: Duration,
    pub max_watch_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub listener_delivery_attempts: u32,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_RECONCILE_WORKERS,
            max_reconcile_attempts: MAX_RECONCILE_ATTEMPTS,
            requeue_base_delay: Duration::from_millis(REQUEUE_BASE_DELAY_MS),
            requeue_max_delay: Duration::from_secs(REQUEUE_MAX_DELAY_SECONDS),
            max_watch_restarts: MAX_WATCH_RESTARTS,
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECONDS),
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECONDS),
            listener_delivery_attempts: LISTENER_DELIVERY_ATTEMPTS,
        }
    }
}

impl WatcherSettings {
    /// Defaults with the `APPMETA_*` environment overrides applied
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(workers) = parse_override::<usize>(WORKERS_ENV, lookup(WORKERS_ENV)) {
            self.workers = workers.max(1);
        }
        if let Some(attempts) = parse_override::<u32>(ATTEMPTS_ENV, lookup(ATTEMPTS_ENV)) {
            self.max_reconcile_attempts = attempts.max(1);
        }
        if let Some(restarts) = parse_override::<u32>(RESTARTS_ENV, lookup(RESTARTS_ENV)) {
            self.max_watch_restarts = restarts.max(1);
        }
        self
    }

    /// Exponential requeue delay for the given failure count (1-based)
    #[must_use]
    pub fn requeue_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        self.requeue_base_delay
            .saturating_mul(2_u32.pow(exponent))
            .min(self.requeue_max_delay)
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
    let raw = value?;
    raw.trim().parse().map_or_else(
        |_| {
            warn!("Ignoring {}={:?}: not a valid number", key, raw);
            None
        },
        Some,
    )
}

/// User agent to send with every API request
#[must_use]
pub fn user_agent() -> String {
    std::env::var(USER_AGENT_ENV)
        .ok()
        .filter(|ua| !ua.trim().is_empty())
        .unwrap_or_else(|| USER_AGENT.to_string())
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_RECONCILE_WORKERS > 0, "DEFAULT_RECONCILE_WORKERS must be greater than 0");
    assert!(MAX_RECONCILE_ATTEMPTS > 0, "MAX_RECONCILE_ATTEMPTS must be greater than 0");
    assert!(MAX_WATCH_RESTARTS > 0, "MAX_WATCH_RESTARTS must be greater than 0");
    assert!(MAX_BACKOFF_SECONDS >= INITIAL_BACKOFF_SECONDS, "MAX_BACKOFF_SECONDS must cover INITIAL_BACKOFF_SECONDS");
    assert!(LISTENER_DELIVERY_ATTEMPTS > 0, "LISTENER_DELIVERY_ATTEMPTS must be greater than 0");
};
