// SPDX-License-Identifier: Apache-2.0

//! Per-node circuit breaker: `Closed` / `Open` / `HalfOpen` state machine
//! with pluggable trip-threshold policies, plus the manager that owns one
//! breaker per node and evicts idle ones.
//!
//! Uses `parking_lot::Mutex` for the per-node state rather than
//! `std::sync::Mutex`, since every critical section here is short and
//! synchronous.

use crate::graph::NodeId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Current state of a single node's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through normally.
    Closed,
    /// Calls are rejected immediately with
    /// [`crate::error::RunError::CircuitBreakerTripped`].
    Open,
    /// A single trial call is allowed through to probe recovery.
    HalfOpen,
}

/// How failures are counted when deciding whether to trip the breaker.
#[derive(Debug, Clone, Copy)]
pub enum ThresholdKind {
    /// Trip after `n` consecutive failures (reset by any success).
    ConsecutiveFailures(u32),
    /// Trip when `n` failures occur within the last `window` calls.
    RollingWindowCount { failures: u32, window: usize },
    /// Trip when the failure rate over the last `window` calls reaches
    /// `rate` (0.0..=1.0), requiring at least `min_calls` samples.
    RollingWindowRate {
        rate: f64,
        window: usize,
        min_calls: usize,
    },
}

/// Configuration for one node's circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// The trip policy.
    pub threshold: ThresholdKind,
    /// How long the breaker stays `Open` before moving to `HalfOpen`.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            threshold: ThresholdKind::ConsecutiveFailures(5),
            open_duration: Duration::from_secs(30),
        }
    }
}

impl From<&crate::graph::CircuitBreakerOptions> for CircuitBreakerConfig {
    fn from(options: &crate::graph::CircuitBreakerOptions) -> Self {
        CircuitBreakerConfig {
            threshold: ThresholdKind::ConsecutiveFailures(options.failure_threshold),
            open_duration: options.open_duration,
        }
    }
}

struct BreakerState {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_trial_in_flight: bool,
    last_activity: Instant,
}

impl BreakerState {
    fn new(config: CircuitBreakerConfig) -> Self {
        BreakerState {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            window: VecDeque::new(),
            opened_at: None,
            half_open_trial_in_flight: false,
            last_activity: Instant::now(),
        }
    }

    fn window_capacity(&self) -> usize {
        match self.config.threshold {
            ThresholdKind::ConsecutiveFailures(_) => 0,
            ThresholdKind::RollingWindowCount { window, .. } => window,
            ThresholdKind::RollingWindowRate { window, .. } => window,
        }
    }

    fn record_window(&mut self, ok: bool) {
        let capacity = self.window_capacity();
        if capacity == 0 {
            return;
        }
        self.window.push_back(ok);
        while self.window.len() > capacity {
            self.window.pop_front();
        }
    }

    fn should_trip(&self) -> bool {
        match self.config.threshold {
            ThresholdKind::ConsecutiveFailures(n) => self.consecutive_failures >= n,
            ThresholdKind::RollingWindowCount { failures, window: _ } => {
                let failure_count = self.window.iter().filter(|ok| !**ok).count() as u32;
                failure_count >= failures
            }
            ThresholdKind::RollingWindowRate {
                rate,
                window: _,
                min_calls,
            } => {
                if self.window.len() < min_calls {
                    return false;
                }
                let failure_count = self.window.iter().filter(|ok| !**ok).count();
                (failure_count as f64 / self.window.len() as f64) >= rate
            }
        }
    }

    /// Call before attempting an operation. Returns `true` if the call may
    /// proceed, transitioning `Open` -> `HalfOpen` once `open_duration` has
    /// elapsed.
    fn try_acquire(&mut self) -> bool {
        self.last_activity = Instant::now();
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_duration {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_trial_in_flight {
                    false
                } else {
                    self.half_open_trial_in_flight = true;
                    true
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.record_window(true);
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.half_open_trial_in_flight = false;
                self.opened_at = None;
                self.window.clear();
            }
            CircuitState::Closed => {}
            CircuitState::Open => {}
        }
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.record_window(false);
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.half_open_trial_in_flight = false;
                self.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                if self.should_trip() {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// A guard returned by [`CircuitBreakerManager::acquire`]. The outcome must
/// be recorded via [`Guard::record_success`] or [`Guard::record_failure`]
/// exactly once.
pub struct Guard<'a> {
    manager: &'a CircuitBreakerManager,
    node: NodeId,
    recorded: bool,
}

impl Guard<'_> {
    /// Records that the guarded operation succeeded.
    pub fn record_success(mut self) {
        self.manager.record(&self.node, true);
        self.recorded = true;
    }

    /// Records that the guarded operation failed.
    pub fn record_failure(mut self) {
        self.manager.record(&self.node, false);
        self.recorded = true;
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            // Treat an un-recorded guard (panic unwind, early return) as a
            // failure: an ambiguous outcome should never be silently
            // counted as a success.
            self.manager.record(&self.node, false);
        }
    }
}

/// Owns one circuit breaker per node, created lazily on first use and
/// evicted after `idle_eviction_after` of inactivity.
pub struct CircuitBreakerManager {
    default_config: CircuitBreakerConfig,
    idle_eviction_after: Duration,
    breakers: Mutex<HashMap<NodeId, BreakerState>>,
}

impl CircuitBreakerManager {
    /// Builds a manager using `default_config` for nodes without a more
    /// specific override, evicting breakers idle for longer than
    /// `idle_eviction_after`.
    pub fn new(default_config: CircuitBreakerConfig, idle_eviction_after: Duration) -> Self {
        CircuitBreakerManager {
            default_config,
            idle_eviction_after,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the current state of `node`'s breaker, or `Closed` if no
    /// breaker has been created for it yet.
    #[must_use]
    pub fn state(&self, node: &NodeId) -> CircuitState {
        self.breakers
            .lock()
            .get(node)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Registers a node-specific override configuration, replacing the
    /// default for that node. Call before the first [`Self::acquire`] for
    /// predictable behavior.
    pub fn configure(&self, node: NodeId, config: CircuitBreakerConfig) {
        self.breakers.lock().insert(node, BreakerState::new(config));
    }

    /// Attempts to acquire permission to call `node`'s wrapped operation.
    /// Returns `None` if the breaker is open (the caller should surface
    /// [`crate::error::RunError::CircuitBreakerTripped`]).
    #[must_use]
    pub fn acquire(&self, node: &NodeId) -> Option<Guard<'_>> {
        let mut breakers = self.breakers.lock();
        let state = breakers
            .entry(node.clone())
            .or_insert_with(|| BreakerState::new(self.default_config.clone()));
        if state.try_acquire() {
            Some(Guard {
                manager: self,
                node: node.clone(),
                recorded: false,
            })
        } else {
            None
        }
    }

    fn record(&self, node: &NodeId, success: bool) {
        let mut breakers = self.breakers.lock();
        if let Some(state) = breakers.get_mut(node) {
            if success {
                state.record_success();
            } else {
                state.record_failure();
            }
        }
    }

    /// Drops breakers that have been idle for longer than
    /// `idle_eviction_after`. Intended to be called periodically by the
    /// pipeline runner's maintenance loop.
    pub fn evict_idle(&self) {
        let cutoff = self.idle_eviction_after;
        self.breakers
            .lock()
            .retain(|_, state| state.last_activity.elapsed() < cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn consecutive_failures_trips_open() {
        let manager = CircuitBreakerManager::new(
            CircuitBreakerConfig {
                threshold: ThresholdKind::ConsecutiveFailures(3),
                open_duration: Duration::from_secs(60),
            },
            Duration::from_secs(600),
        );
        let n = node("a");
        for _ in 0..2 {
            manager.acquire(&n).unwrap().record_failure();
        }
        assert_eq!(manager.state(&n), CircuitState::Closed);
        manager.acquire(&n).unwrap().record_failure();
        assert_eq!(manager.state(&n), CircuitState::Open);
        assert!(manager.acquire(&n).is_none());
    }

    #[test]
    fn success_resets_consecutive_count() {
        let manager = CircuitBreakerManager::new(
            CircuitBreakerConfig {
                threshold: ThresholdKind::ConsecutiveFailures(2),
                open_duration: Duration::from_secs(60),
            },
            Duration::from_secs(600),
        );
        let n = node("a");
        manager.acquire(&n).unwrap().record_failure();
        manager.acquire(&n).unwrap().record_success();
        manager.acquire(&n).unwrap().record_failure();
        assert_eq!(manager.state(&n), CircuitState::Closed);
    }

    #[test]
    fn half_open_allows_single_trial_then_closes_on_success() {
        let manager = CircuitBreakerManager::new(
            CircuitBreakerConfig {
                threshold: ThresholdKind::ConsecutiveFailures(1),
                open_duration: Duration::from_millis(1),
            },
            Duration::from_secs(600),
        );
        let n = node("a");
        manager.acquire(&n).unwrap().record_failure();
        assert_eq!(manager.state(&n), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(5));
        let guard = manager.acquire(&n).expect("half-open trial should be allowed");
        assert!(manager.acquire(&n).is_none(), "second concurrent trial must be rejected");
        guard.record_success();
        assert_eq!(manager.state(&n), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let manager = CircuitBreakerManager::new(
            CircuitBreakerConfig {
                threshold: ThresholdKind::ConsecutiveFailures(1),
                open_duration: Duration::from_millis(1),
            },
            Duration::from_secs(600),
        );
        let n = node("a");
        manager.acquire(&n).unwrap().record_failure();
        std::thread::sleep(Duration::from_millis(5));
        manager.acquire(&n).unwrap().record_failure();
        assert_eq!(manager.state(&n), CircuitState::Open);
    }

    #[test]
    fn rolling_window_rate_trips_once_min_calls_reached() {
        let manager = CircuitBreakerManager::new(
            CircuitBreakerConfig {
                threshold: ThresholdKind::RollingWindowRate {
                    rate: 0.5,
                    window: 4,
                    min_calls: 4,
                },
                open_duration: Duration::from_secs(60),
            },
            Duration::from_secs(600),
        );
        let n = node("a");
        manager.acquire(&n).unwrap().record_failure();
        manager.acquire(&n).unwrap().record_success();
        assert_eq!(manager.state(&n), CircuitState::Closed);
        manager.acquire(&n).unwrap().record_failure();
        manager.acquire(&n).unwrap().record_failure();
        assert_eq!(manager.state(&n), CircuitState::Open);
    }

    #[test]
    fn dropped_guard_without_recording_counts_as_failure() {
        let manager = CircuitBreakerManager::new(
            CircuitBreakerConfig {
                threshold: ThresholdKind::ConsecutiveFailures(1),
                open_duration: Duration::from_secs(60),
            },
            Duration::from_secs(600),
        );
        let n = node("a");
        {
            let _guard = manager.acquire(&n).unwrap();
        }
        assert_eq!(manager.state(&n), CircuitState::Open);
    }

    #[test]
    fn evict_idle_drops_stale_breakers() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default(), Duration::from_millis(1));
        let n = node("a");
        manager.acquire(&n).unwrap().record_success();
        std::thread::sleep(Duration::from_millis(5));
        manager.evict_idle();
        assert_eq!(manager.breakers.lock().len(), 0);
    }
}
