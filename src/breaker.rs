//! Per-provider circuit breakers.
//!
//! Each registered provider gets a Closed → Open → Half-Open state machine
//! driven by consecutive failures. Open circuits block attempts for a
//! cooldown; the first `allow` after the cooldown admits exactly one probe
//! (single-probe discipline) — concurrent callers observing the transition
//! are still treated as Open until the probe resolves.
//!
//! Admission hands out an [`AttemptPermit`] that must be resolved with the
//! invocation outcome. An unresolved permit resolves as a failure on drop,
//! so a caller that disappears mid-attempt (cancellation, disconnect)
//! cannot strand a half-open probe and blacklist the provider forever.
//!
//! State lives in-process, one mutex per provider, so routers scale
//! horizontally at the cost of replicas tripping circuits independently.
//! That trade-off (availability over synchronized circuit state) is
//! deliberate; the budget ledger is the component that must be shared.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before Closed → Open.
    pub failure_threshold: u32,
    /// How long an Open circuit blocks before admitting a probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Observable state of one provider's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; attempts allowed.
    Closed,
    /// Provider presumed broken; attempts blocked until cooldown elapses.
    Open,
    /// One probe in flight to test recovery.
    HalfOpen,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// The set of circuits for all registered providers.
///
/// Built once from the registry's provider names; the map itself is
/// immutable afterwards, so lookups never contend across providers — only
/// the per-provider mutex serializes transitions.
pub struct CircuitBreakerSet {
    config: BreakerConfig,
    circuits: HashMap<String, Mutex<Circuit>>,
}

impl CircuitBreakerSet {
    /// Create circuits (all Closed) for the given provider names.
    pub fn new(config: BreakerConfig, providers: impl IntoIterator<Item = String>) -> Self {
        let circuits = providers
            .into_iter()
            .map(|name| (name, Mutex::new(Circuit::new())))
            .collect();
        Self { config, circuits }
    }

    /// Request permission to attempt `provider`.
    ///
    /// `None` means the circuit blocks the attempt. `Some` carries a permit
    /// that must be resolved: [`AttemptPermit::success`] or
    /// [`AttemptPermit::failure`] after an invocation,
    /// [`AttemptPermit::skip`] when the candidate is passed over before
    /// invoking. A permit dropped unresolved records a failure.
    ///
    /// In Open state this is the call that performs the Open → HalfOpen
    /// transition once the cooldown has elapsed, and it admits exactly one
    /// probe.
    pub fn allow(&self, provider: &str) -> Option<AttemptPermit<'_>> {
        let admitted = match self.circuits.get(provider) {
            None => {
                warn!(provider, "no circuit registered; allowing attempt");
                true
            }
            Some(circuit) => {
                let mut c = lock(circuit);
                match c.state {
                    CircuitState::Closed => true,
                    CircuitState::Open => {
                        let cooled = c
                            .opened_at
                            .map(|t| t.elapsed() >= self.config.cooldown)
                            .unwrap_or(true);
                        if cooled {
                            info!(provider, "circuit cooldown elapsed; admitting probe");
                            c.state = CircuitState::HalfOpen;
                            c.probe_in_flight = true;
                            true
                        } else {
                            debug!(provider, "circuit open; blocking attempt");
                            false
                        }
                    }
                    CircuitState::HalfOpen => {
                        if c.probe_in_flight {
                            debug!(provider, "probe already in flight; blocking attempt");
                            false
                        } else {
                            c.probe_in_flight = true;
                            true
                        }
                    }
                }
            }
        };
        admitted.then(|| AttemptPermit {
            set: self,
            provider: Some(provider.to_string()),
        })
    }

    /// Record a successful invocation.
    pub fn record_success(&self, provider: &str) {
        let Some(circuit) = self.circuits.get(provider) else {
            return;
        };
        let mut c = lock(circuit);
        match c.state {
            CircuitState::Closed => {
                if c.failure_count > 0 {
                    debug!(
                        provider,
                        failures = c.failure_count,
                        "success; resetting failure count"
                    );
                }
                c.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                info!(provider, "probe succeeded; closing circuit");
                c.state = CircuitState::Closed;
                c.failure_count = 0;
                c.opened_at = None;
                c.probe_in_flight = false;
            }
            CircuitState::Open => {
                // Success while Open means a call raced the transition.
                warn!(provider, "success recorded while circuit open");
            }
        }
    }

    /// Record a failed or timed-out invocation.
    pub fn record_failure(&self, provider: &str) {
        let Some(circuit) = self.circuits.get(provider) else {
            return;
        };
        let mut c = lock(circuit);
        match c.state {
            CircuitState::Closed => {
                c.failure_count += 1;
                if c.failure_count >= self.config.failure_threshold {
                    warn!(
                        provider,
                        failures = c.failure_count,
                        "failure threshold reached; opening circuit"
                    );
                    c.state = CircuitState::Open;
                    c.opened_at = Some(Instant::now());
                } else {
                    debug!(
                        provider,
                        failures = c.failure_count,
                        threshold = self.config.failure_threshold,
                        "failure recorded"
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!(provider, "probe failed; reopening circuit");
                c.state = CircuitState::Open;
                c.opened_at = Some(Instant::now());
                c.probe_in_flight = false;
            }
            CircuitState::Open => {
                debug!(provider, "failure recorded while circuit already open");
            }
        }
    }

    /// Current state of `provider`'s circuit, if registered.
    pub fn state(&self, provider: &str) -> Option<CircuitState> {
        self.circuits.get(provider).map(|c| lock(c).state)
    }

    /// Consecutive failure count for `provider`, if registered.
    pub fn failure_count(&self, provider: &str) -> Option<u32> {
        self.circuits.get(provider).map(|c| lock(c).failure_count)
    }
}

/// Permission for one attempt against a provider.
///
/// Exactly one resolution applies. Dropping the permit unresolved counts
/// as a failure: a held half-open probe reopens with a fresh cooldown,
/// and a closed circuit's failure count increments.
#[must_use = "an unresolved permit records a failure on drop"]
pub struct AttemptPermit<'a> {
    set: &'a CircuitBreakerSet,
    provider: Option<String>,
}

impl AttemptPermit<'_> {
    /// Resolve as a successful invocation.
    pub fn success(mut self) {
        if let Some(provider) = self.provider.take() {
            self.set.record_success(&provider);
        }
    }

    /// Resolve as a failed or timed-out invocation.
    pub fn failure(mut self) {
        if let Some(provider) = self.provider.take() {
            self.set.record_failure(&provider);
        }
    }

    /// Release without an invocation outcome (candidate skipped before
    /// invoke). A held half-open probe reopens the circuit so the next
    /// cooldown can admit a fresh one; closed circuits are untouched.
    pub fn skip(mut self) {
        if let Some(provider) = self.provider.take() {
            if self.set.state(&provider) == Some(CircuitState::HalfOpen) {
                self.set.record_failure(&provider);
            }
        }
    }
}

impl Drop for AttemptPermit<'_> {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            warn!(provider = %provider, "attempt abandoned without an outcome; recording failure");
            self.set.record_failure(&provider);
        }
    }
}

// A poisoned circuit mutex means a panic mid-transition; the state is a
// plain struct with no invariants broken by partial writes, so continue.
fn lock(circuit: &Mutex<Circuit>) -> std::sync::MutexGuard<'_, Circuit> {
    circuit.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl std::fmt::Debug for CircuitBreakerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerSet")
            .field("providers", &self.circuits.len())
            .field("threshold", &self.config.failure_threshold)
            .field("cooldown", &self.config.cooldown)
            .finish()
    }
}
