use crate::domain::services::clock::{Clock, SystemClock};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Circuit breaker thresholds. A zero disables the corresponding check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Trip after this many failures in a row
    pub max_consecutive_failures: u32,
    /// Trip after this many failures within the last hour
    pub max_failures_per_hour: u32,
    /// Auto-reset after this many minutes tripped (0 = manual reset only)
    pub cooldown_minutes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            max_failures_per_hour: 10,
            cooldown_minutes: 30,
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    /// New entries allowed
    Closed,
    /// New entries blocked
    Tripped,
}

/// Everything behind the lock, config included, so updates are atomic.
#[derive(Debug)]
struct CircuitBreakerState {
    config: CircuitBreakerConfig,
    consecutive_failures: u32,
    hourly_failures: VecDeque<DateTime<Utc>>,
    tripped: bool,
    tripped_at: Option<DateTime<Utc>>,
    trip_reason: String,
}

impl CircuitBreakerState {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            hourly_failures: VecDeque::new(),
            tripped: false,
            tripped_at: None,
            trip_reason: String::new(),
        }
    }

    /// Drop failures that are an hour old or older.
    fn prune_hourly_failures(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(1);
        while let Some(&oldest) = self.hourly_failures.front() {
            if oldest <= cutoff {
                self.hourly_failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn trip(&mut self, now: DateTime<Utc>, reason: String) {
        error!(reason = %reason, "circuit breaker TRIPPED");
        self.tripped = true;
        self.tripped_at = Some(now);
        self.trip_reason = reason;
    }

    fn reset(&mut self) {
        self.tripped = false;
        self.tripped_at = None;
        self.trip_reason.clear();
        self.consecutive_failures = 0;
        self.hourly_failures.clear();
    }

    fn check_tripped(&mut self, now: DateTime<Utc>) -> bool {
        if !self.tripped {
            return false;
        }
        if self.cooldown_expired(now) {
            warn!(
                cooldown_minutes = self.config.cooldown_minutes,
                "circuit breaker cooldown expired, auto-resetting"
            );
            self.reset();
            return false;
        }
        true
    }

    fn cooldown_expired(&self, now: DateTime<Utc>) -> bool {
        if self.config.cooldown_minutes == 0 {
            return false;
        }
        let cooldown = Duration::minutes(i64::from(self.config.cooldown_minutes));
        match self.tripped_at {
            Some(tripped_at) => now - tripped_at >= cooldown,
            None => false,
        }
    }
}

/// Halts new trade entries after repeated operational failures
///
/// Two independent triggers:
/// - **Consecutive failures** catch bursts such as a broker outage.
/// - **Failures per hour** catch slower degradation such as intermittent
///   order rejections. `record_success` does not clear this window.
///
/// Once tripped, the breaker stays tripped until the cooldown elapses (checked
/// lazily in [`CircuitBreaker::is_tripped`]) or [`CircuitBreaker::reset`] is
/// called. Exits are never routed through the breaker by callers.
///
/// # Example
/// ```rust,no_run
/// use tradegate::domain::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
///
/// # async fn run() {
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
/// breaker.record_failure("PlaceOrder BUY INFY: timeout").await;
/// if !breaker.is_tripped().await {
///     // place the entry order
/// }
/// # }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<CircuitBreakerState>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(CircuitBreakerState::new(config)),
            clock,
        }
    }

    /// Record an operational failure and trip if a threshold is reached.
    /// Ignored while already tripped so the first trip reason is kept.
    pub async fn record_failure(&self, reason: &str) {
        let mut state = self.state.lock().await;
        if state.tripped {
            return;
        }

        let now = self.clock.now();
        state.prune_hourly_failures(now);
        state.consecutive_failures += 1;
        state.hourly_failures.push_back(now);

        let max_consecutive = state.config.max_consecutive_failures;
        if max_consecutive > 0 && state.consecutive_failures >= max_consecutive {
            let message = format!(
                "consecutive failures: {} >= {} (last: {})",
                state.consecutive_failures, max_consecutive, reason
            );
            state.trip(now, message);
            return;
        }

        let max_hourly = state.config.max_failures_per_hour;
        let hourly = state.hourly_failures.len();
        if max_hourly > 0 && hourly >= max_hourly as usize {
            let message = format!(
                "hourly failures: {} >= {} (last: {})",
                hourly, max_hourly, reason
            );
            state.trip(now, message);
            return;
        }

        warn!(
            reason,
            consecutive = state.consecutive_failures,
            hourly,
            "circuit breaker failure recorded"
        );
    }

    /// Clear the consecutive counter. Never touches the hourly window or
    /// the tripped flag.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = 0;
    }

    /// Whether new entries are currently blocked. Performs the cooldown
    /// auto-reset when it has elapsed.
    pub async fn is_tripped(&self) -> bool {
        let mut state = self.state.lock().await;
        state.check_tripped(self.clock.now())
    }

    /// Trip reason if entries are blocked, `None` when closed. Same
    /// auto-reset as `is_tripped`, read under one lock.
    pub async fn halt_reason(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        state
            .check_tripped(self.clock.now())
            .then(|| state.trip_reason.clone())
    }

    /// Reason for the current trip, empty when closed
    pub async fn trip_reason(&self) -> String {
        let state = self.state.lock().await;
        if state.tripped {
            state.trip_reason.clone()
        } else {
            String::new()
        }
    }

    /// Manual reset to closed, regardless of cooldown
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if state.tripped {
            warn!(was = %state.trip_reason, "circuit breaker manually reset");
        }
        state.reset();
    }

    /// Replace thresholds. Does not reset a trip; a lowered threshold applies
    /// from the next recorded failure.
    pub async fn update_config(&self, config: CircuitBreakerConfig) {
        let mut state = self.state.lock().await;
        info!(
            max_consecutive = config.max_consecutive_failures,
            max_hourly = config.max_failures_per_hour,
            cooldown_minutes = config.cooldown_minutes,
            "circuit breaker config updated"
        );
        state.config = config;
    }

    pub async fn config(&self) -> CircuitBreakerConfig {
        self.state.lock().await.config.clone()
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    /// Failures within the last hour, pruned at query time
    pub async fn hourly_failures(&self) -> usize {
        let mut state = self.state.lock().await;
        state.prune_hourly_failures(self.clock.now());
        state.hourly_failures.len()
    }

    /// Point-in-time view for status endpoints. Does not auto-reset.
    pub async fn stats(&self) -> CircuitBreakerStats {
        let mut state = self.state.lock().await;
        state.prune_hourly_failures(self.clock.now());
        CircuitBreakerStats {
            state: if state.tripped {
                CircuitState::Tripped
            } else {
                CircuitState::Closed
            },
            consecutive_failures: state.consecutive_failures,
            hourly_failures: state.hourly_failures.len(),
            tripped_at: state.tripped_at,
            trip_reason: state.trip_reason.clone(),
        }
    }
}

/// Statistics about circuit breaker state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub hourly_failures: usize,
    pub tripped_at: Option<DateTime<Utc>>,
    pub trip_reason: String,
}
