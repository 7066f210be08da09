//! Per-host failure tracking and circuit breaking.
//!
//! Every delivery outcome feeds a rolling per-host score. Hosts that fail
//! repeatedly get their circuit opened: the claim loop stops leasing
//! envelopes for them until a cooldown elapses, then a single HalfOpen
//! probe decides whether to close the circuit or re-open it with a doubled
//! cooldown.
//!
//! State is process-local. Circuit breaking is a performance
//! optimization, not a correctness mechanism; with several dispatcher
//! processes the worst case is one extra failed attempt per process.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::OutcomeKind;

/// Circuit breaker state for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// What the claim loop may do with a host's envelopes right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostGate {
    /// Circuit closed; claim freely.
    Allow,
    /// Circuit open; leave envelopes Pending, do not lease.
    Skip,
    /// Circuit half-open; claim exactly one envelope as the probe.
    Probe,
}

/// Rolling health record for one host.
#[derive(Debug, Clone)]
pub struct HostHealth {
    /// Consecutive transient/timeout failures; permanent rejections
    /// reset the streak, since the host responded.
    pub consecutive_failures: u32,
    /// Exponentially-weighted rate of responsive outcomes in [0, 1].
    pub success_rate: f64,
    pub circuit: CircuitState,
    pub opened_at_ms: u64,
    /// Current cooldown; doubles on a failed probe, capped.
    pub cooldown_ms: u64,
    probe_in_flight: bool,
    last_seen_ms: u64,
}

/// Breaker and scoring configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive failures that open the circuit.
    pub threshold: u32,
    /// Initial cooldown before a HalfOpen probe is allowed.
    pub cooldown_ms: u64,
    /// Ceiling for the doubling cooldown.
    pub max_cooldown_ms: u64,
    /// EWMA smoothing factor for the success rate.
    pub ewma_alpha: f64,
    /// Bound on tracked hosts; least-recently-seen entries are evicted.
    pub max_hosts: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown_ms: 60_000,
            max_cooldown_ms: 60 * 60 * 1_000,
            ewma_alpha: 0.2,
            max_hosts: 10_000,
        }
    }
}

/// Tracks health for every host the engine has attempted.
pub struct HostHealthTracker {
    config: HealthConfig,
    hosts: Mutex<HashMap<String, HostHealth>>,
}

impl HostHealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Record one delivery outcome for a host.
    pub fn record(&self, host: &str, kind: &OutcomeKind, now_ms: u64) {
        let mut hosts = self.hosts.lock().expect("health lock");
        self.evict_if_needed(&mut hosts, host);

        let entry = hosts.entry(host.to_string()).or_insert_with(|| HostHealth {
            consecutive_failures: 0,
            success_rate: 1.0,
            circuit: CircuitState::Closed,
            opened_at_ms: 0,
            cooldown_ms: self.config.cooldown_ms,
            probe_in_flight: false,
            last_seen_ms: now_ms,
        });
        entry.last_seen_ms = now_ms;

        let alpha = self.config.ewma_alpha;
        let sample = if kind.is_host_failure() { 0.0 } else { 1.0 };
        entry.success_rate = alpha * sample + (1.0 - alpha) * entry.success_rate;

        if kind.is_host_failure() {
            entry.consecutive_failures += 1;
            match entry.circuit {
                CircuitState::HalfOpen => {
                    // Failed probe: back to Open with a doubled cooldown.
                    entry.circuit = CircuitState::Open;
                    entry.opened_at_ms = now_ms;
                    entry.cooldown_ms =
                        (entry.cooldown_ms * 2).min(self.config.max_cooldown_ms);
                    entry.probe_in_flight = false;
                }
                CircuitState::Closed => {
                    if entry.consecutive_failures >= self.config.threshold {
                        entry.circuit = CircuitState::Open;
                        entry.opened_at_ms = now_ms;
                    }
                }
                CircuitState::Open => {}
            }
        } else {
            entry.consecutive_failures = 0;
            if entry.circuit == CircuitState::HalfOpen {
                entry.cooldown_ms = self.config.cooldown_ms;
            }
            entry.circuit = CircuitState::Closed;
            entry.probe_in_flight = false;
        }
    }

    /// Ask whether the claim loop may lease envelopes for a host.
    ///
    /// An Open circuit whose cooldown has elapsed flips to HalfOpen here;
    /// HalfOpen hands out a single `Probe` until that probe's outcome is
    /// recorded.
    pub fn gate(&self, host: &str, now_ms: u64) -> HostGate {
        let mut hosts = self.hosts.lock().expect("health lock");
        let Some(entry) = hosts.get_mut(host) else {
            return HostGate::Allow;
        };
        entry.last_seen_ms = now_ms;

        match entry.circuit {
            CircuitState::Closed => HostGate::Allow,
            CircuitState::Open => {
                if now_ms >= entry.opened_at_ms + entry.cooldown_ms {
                    entry.circuit = CircuitState::HalfOpen;
                    entry.probe_in_flight = true;
                    HostGate::Probe
                } else {
                    HostGate::Skip
                }
            }
            CircuitState::HalfOpen => {
                if entry.probe_in_flight {
                    HostGate::Skip
                } else {
                    entry.probe_in_flight = true;
                    HostGate::Probe
                }
            }
        }
    }

    /// Return an unused probe slot.
    ///
    /// The claim loop calls this when a `Probe` gate was handed out but no
    /// ready envelope for the host was actually claimed, so a later tick
    /// can probe instead.
    pub fn release_probe(&self, host: &str) {
        let mut hosts = self.hosts.lock().expect("health lock");
        if let Some(entry) = hosts.get_mut(host) {
            if entry.circuit == CircuitState::HalfOpen {
                entry.probe_in_flight = false;
            }
        }
    }

    /// Current circuit state for a host, if tracked.
    pub fn circuit_state(&self, host: &str) -> Option<CircuitState> {
        let hosts = self.hosts.lock().expect("health lock");
        hosts.get(host).map(|h| h.circuit)
    }

    /// Snapshot of a host's health record.
    pub fn snapshot(&self, host: &str) -> Option<HostHealth> {
        let hosts = self.hosts.lock().expect("health lock");
        hosts.get(host).cloned()
    }

    fn evict_if_needed(&self, hosts: &mut HashMap<String, HostHealth>, incoming: &str) {
        if hosts.len() < self.config.max_hosts || hosts.contains_key(incoming) {
            return;
        }
        let oldest = hosts
            .iter()
            .min_by_key(|(_, h)| h.last_seen_ms)
            .map(|(host, _)| host.clone());
        if let Some(host) = oldest {
            hosts.remove(&host);
        }
    }
}
