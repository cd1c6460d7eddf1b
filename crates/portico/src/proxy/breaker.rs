//! Circuit breaker implementation for upstream service protection.
//!
//! A per-backend three-state gate driven by proxy outcomes. Unlike a
//! wrapping breaker that owns the call, this one is consulted at backend
//! *selection* time (`try_admit`) and fed observations afterwards
//! (`record_success` / `record_failure`), which is what the round-robin
//! selection loop needs.

use crate::models::settings::BreakerSettings;
use log::{info, warn};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Process-wide monotonic epoch; breaker timestamps are millisecond offsets
/// from here so they fit in atomics and never regress with wall-clock
/// adjustments.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_millis() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,   // Normal operation
    Open = 1,     // Failing fast, cooling down
    HalfOpen = 2, // Probing for recovery
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl CircuitState {
    fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Configuration parameters for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// How long an open circuit waits before admitting probes.
    pub cooldown: Duration,
    /// Probe budget granted on the open → half-open transition.
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            cooldown: Duration::from_secs(settings.cooldown_seconds),
            half_open_probes: settings.half_open_probes,
        }
    }
}

/// Circuit breaker guarding one backend.
///
/// # States
///
/// - **Closed**: requests flow; consecutive failures are counted.
/// - **Open**: requests are refused until `cooldown` has elapsed since the
///   last failure, then the breaker moves to half-open.
/// - **HalfOpen**: up to `half_open_probes` requests are admitted; the
///   first success closes the circuit, the first failure re-opens it.
///
/// # Thread Safety
///
/// State, counters, and timestamps are atomics; transitions are lock-free.
/// Every transition emits a `circuit_breaker_state_change` log line with
/// the from/to states.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    last_failure_millis: AtomicU64,
    probes_remaining: AtomicI64,
    name: String,
}

impl CircuitBreaker {
    pub fn new(name: String, config: BreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            last_failure_millis: AtomicU64::new(0),
            probes_remaining: AtomicI64::new(0),
            name,
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Relaxed))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Selection-time gate: may a request be routed to this backend now?
    ///
    /// - Closed: yes.
    /// - Open: yes once the cooldown has elapsed (transitioning to
    ///   half-open and arming the probe budget), otherwise no.
    /// - HalfOpen: yes while the probe budget lasts, otherwise no.
    pub fn try_admit(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let last = self.last_failure_millis.load(Ordering::Relaxed);
                let elapsed = now_millis().saturating_sub(last);
                if elapsed < self.config.cooldown.as_millis() as u64 {
                    return false;
                }
                // Only one caller wins the open → half-open transition and
                // arms the probe budget; racers fall through to the normal
                // half-open budget check.
                if self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.probes_remaining
                        .store(self.config.half_open_probes as i64 - 1, Ordering::Relaxed);
                    info!(
                        "component=proxy event=circuit_breaker_state_change backend={} from=open to=half_open",
                        self.name
                    );
                    true
                } else {
                    self.probes_remaining.fetch_sub(1, Ordering::Relaxed) > 0
                }
            }
            CircuitState::HalfOpen => self.probes_remaining.fetch_sub(1, Ordering::Relaxed) > 0,
        }
    }

    /// Records a successful observation (response < 500).
    ///
    /// Resets the failure counter; from half-open the circuit closes.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.state() == CircuitState::HalfOpen {
            self.transition(CircuitState::HalfOpen, CircuitState::Closed);
        }
    }

    /// Records a failed observation (transport error or response >= 500).
    pub fn record_failure(&self) {
        self.last_failure_millis.store(now_millis(), Ordering::Relaxed);

        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition(CircuitState::Closed, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // A failed probe re-opens immediately.
                self.transition(CircuitState::HalfOpen, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Forces the breaker closed, clearing counters.
    ///
    /// Used by the health checker when a backend transitions back to
    /// healthy.
    pub fn reset(&self) {
        let previous = self.state();
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.probes_remaining.store(0, Ordering::Relaxed);
        if previous != CircuitState::Closed {
            self.transition(previous, CircuitState::Closed);
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) {
        self.state.store(to as u8, Ordering::Relaxed);
        if to == CircuitState::Open {
            warn!(
                "component=proxy event=circuit_breaker_state_change backend={} from={} to={}",
                self.name,
                from.as_str(),
                to.as_str()
            );
        } else {
            info!(
                "component=proxy event=circuit_breaker_state_change backend={} from={} to={}",
                self.name,
                from.as_str(),
                to.as_str()
            );
        }
    }
}
