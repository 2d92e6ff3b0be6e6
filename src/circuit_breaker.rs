//! Per-endpoint circuit breaker: Closed/Open/HalfOpen failure isolation with
//! a lock-free fast path and a mutex strictly around state transitions.
//!
//! `execute` never synthesizes any error other than [`BreakerError::CircuitOpen`];
//! every other outcome is exactly what the wrapped call produced.

use crate::clock::{Clock, MonotonicClock};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_raw(v: u8) -> Self {
        match v {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("invalid circuit breaker state byte"),
        }
    }

    fn raw(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// A listener invoked out-of-band, in its own detached task, on every
/// transition. Must never be invoked while the transition mutex is held.
pub type StateChangeListener = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures, from Closed, before the breaker trips to Open.
    pub max_failures: u32,
    /// How long an Open breaker waits before admitting a HalfOpen probe.
    pub timeout: Duration,
    pub on_state_change: Option<StateChangeListener>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout: Duration::from_secs(60),
            on_state_change: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Normalizes zero values to the documented defaults (5 failures, 60s).
    pub fn normalized(mut self) -> Self {
        if self.max_failures == 0 {
            self.max_failures = 5;
        }
        if self.timeout.is_zero() {
            self.timeout = Duration::from_secs(60);
        }
        self
    }
}

/// Outcome of a breaker-wrapped call: either the inner error, or the
/// breaker's own short-circuit. No other error is synthesized.
#[derive(Debug)]
pub enum BreakerError<E> {
    CircuitOpen { failures: u32, open_for: Duration },
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::CircuitOpen { failures, open_for } => write!(
                f,
                "circuit open (failures={failures}, open for {open_for:?})"
            ),
            BreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E> BreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, BreakerError::CircuitOpen { .. })
    }
}

struct Counters {
    state: AtomicU8,
    failure_count: AtomicU32,
    last_fail_time_millis: AtomicU64,
}

/// A single endpoint's circuit breaker. Cheap to clone; the inner state is
/// shared via `Arc`.
#[derive(Clone)]
pub struct CircuitBreaker {
    counters: Arc<Counters>,
    transition: Arc<Mutex<()>>,
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            counters: Arc::new(Counters {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicU32::new(0),
                last_fail_time_millis: AtomicU64::new(0),
            }),
            transition: Arc::new(Mutex::new(())),
            config: Arc::new(config.normalized()),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.counters.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.counters.failure_count.load(Ordering::Acquire)
    }

    /// Runs `f` unless the breaker is Open within its timeout window, in
    /// which case `f` is never called and `BreakerError::CircuitOpen` is
    /// returned. Any `Err` produced by `f` counts as a failure regardless of
    /// its kind; timeouts and cancellations the caller folds into `E` count
    /// the same as business errors.
    pub async fn execute<T, E, Fut, Op>(&self, op: Op) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        loop {
            match CircuitState::from_raw(self.counters.state.load(Ordering::Acquire)) {
                CircuitState::Closed => break,
                CircuitState::HalfOpen => break,
                CircuitState::Open => {
                    let opened_at = self.counters.last_fail_time_millis.load(Ordering::Acquire);
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(opened_at);
                    if elapsed <= self.config.timeout.as_millis() as u64 {
                        return Err(BreakerError::CircuitOpen {
                            failures: self.counters.failure_count.load(Ordering::Acquire),
                            open_for: Duration::from_millis(elapsed),
                        });
                    }
                    // Past the timeout: try to admit a HalfOpen probe.
                    let _guard = self.transition.lock();
                    if self.counters.state.load(Ordering::Acquire) == STATE_OPEN {
                        self.transition_to(CircuitState::Open, CircuitState::HalfOpen);
                    }
                    drop(_guard);
                    continue;
                }
            }
        }

        match op().await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                self.on_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn on_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                let _guard = self.transition.lock();
                if self.counters.state.load(Ordering::Acquire) == STATE_HALF_OPEN {
                    self.counters.failure_count.store(0, Ordering::Release);
                    self.counters.last_fail_time_millis.store(0, Ordering::Release);
                    self.transition_to(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                self.counters.failure_count.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                let _guard = self.transition.lock();
                if self.counters.state.load(Ordering::Acquire) == STATE_HALF_OPEN {
                    self.counters
                        .last_fail_time_millis
                        .store(self.clock.now_millis(), Ordering::Release);
                    self.transition_to(CircuitState::HalfOpen, CircuitState::Open);
                }
            }
            CircuitState::Closed => {
                let failures = self.counters.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.max_failures {
                    let _guard = self.transition.lock();
                    if self.counters.state.load(Ordering::Acquire) == STATE_CLOSED {
                        self.counters
                            .last_fail_time_millis
                            .store(self.clock.now_millis(), Ordering::Release);
                        self.transition_to(CircuitState::Closed, CircuitState::Open);
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to Closed, clearing counters. Notifies the
    /// listener only if the state actually changed.
    pub fn reset(&self) {
        let _guard = self.transition.lock();
        let from = self.state();
        self.counters.failure_count.store(0, Ordering::Release);
        self.counters.last_fail_time_millis.store(0, Ordering::Release);
        if from != CircuitState::Closed {
            self.transition_to(from, CircuitState::Closed);
        } else {
            self.counters.state.store(STATE_CLOSED, Ordering::Release);
        }
    }

    /// Caller must hold `transition` and have already re-checked `from`
    /// under the lock (double-checked locking).
    fn transition_to(&self, from: CircuitState, to: CircuitState) {
        self.counters.state.store(to.raw(), Ordering::Release);
        tracing::info!(from = %from, to = %to, "circuit breaker state change");
        if let Some(listener) = self.config.on_state_change.clone() {
            tokio::spawn(async move {
                listener(from, to);
            });
        }
    }
}
