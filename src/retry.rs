//! Retry policy: outcome classification to next envelope state.
//!
//! Pure given (envelope, outcome, policy); all persistence is the
//! ledger's job. Backoff is exponential with full-range jitter and a hard
//! cap, and attempts are bounded.

use crate::error::OutcomeKind;
use crate::types::{Envelope, EnvelopeState};

/// Backoff and attempt-budget configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for the first retry, in milliseconds.
    pub base_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub cap_ms: u64,
    /// Attempts after which a transiently-failing envelope is abandoned.
    pub max_attempts: u32,
    /// Multiply delays by a uniform factor in [0.5, 1.5). Disabled in
    /// tests that assert exact schedules.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 60_000,
            cap_ms: 24 * 60 * 60 * 1_000,
            max_attempts: 16,
            jitter: true,
        }
    }
}

/// What the scheduler should do with an envelope after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Move to a terminal state and notify the application.
    Terminal(EnvelopeState),
    /// Reschedule: bump the attempt counter and push `not_before` out.
    Retry { attempt: u32, not_before_ms: u64 },
}

impl RetryPolicy {
    /// Pre-jitter delay for a given attempt count: `base` for the first
    /// retry, doubling thereafter.
    ///
    /// Monotonic in `attempt` until it saturates at `cap_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let base = self.base_ms.max(1);
        let exp = attempt.saturating_sub(1).min(63);
        let raw = base.saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX));
        raw.min(self.cap_ms.max(base))
    }

    /// Delay with jitter applied, when enabled.
    pub fn jittered_delay(&self, attempt: u32) -> u64 {
        self.backoff_for_host(attempt, 1.0)
    }

    /// Jittered backoff for one host, stretched when the host's rolling
    /// success rate is degraded: unchanged at a rate of 0.5 or better,
    /// rising to twice the nominal delay as the rate approaches zero.
    /// Still capped at `cap_ms` pre-jitter.
    pub fn backoff_for_host(&self, attempt: u32, success_rate: f64) -> u64 {
        let nominal = self.delay_for_attempt(attempt);
        let scaled = (nominal as f64 * host_multiplier(success_rate)) as u64;
        let delay = scaled.min(self.cap_ms.max(self.base_ms.max(1)));
        if !self.jitter {
            return delay;
        }
        let factor = 0.5 + fastrand::f64();
        (delay as f64 * factor) as u64
    }

    /// Decide the envelope's next state from one attempt's outcome.
    /// `host_success_rate` is the host's rolling health score; degraded
    /// hosts get their retries pushed further out.
    pub fn disposition(
        &self,
        envelope: &Envelope,
        kind: &OutcomeKind,
        now_ms: u64,
        host_success_rate: f64,
    ) -> Disposition {
        match kind {
            OutcomeKind::Success => Disposition::Terminal(EnvelopeState::Succeeded),
            OutcomeKind::PermanentFailure { .. } => {
                Disposition::Terminal(EnvelopeState::PermanentlyFailed)
            }
            OutcomeKind::TransientFailure { .. } | OutcomeKind::Timeout => {
                let attempt = envelope.attempt + 1;
                if attempt >= self.max_attempts {
                    Disposition::Terminal(EnvelopeState::Abandoned)
                } else {
                    Disposition::Retry {
                        attempt,
                        not_before_ms: now_ms
                            + self.backoff_for_host(attempt, host_success_rate),
                    }
                }
            }
        }
    }
}

/// Backoff multiplier for a host's health score: 1.0 at a success rate
/// of 0.5 or above, linear up to 2.0 at zero.
fn host_multiplier(success_rate: f64) -> f64 {
    2.0 - 2.0 * success_rate.clamp(0.0, 0.5)
}

/// Render an outcome as the envelope's `last_error` string.
pub fn describe_outcome(kind: &OutcomeKind) -> Option<String> {
    match kind {
        OutcomeKind::Success => None,
        OutcomeKind::TransientFailure { status: Some(s) } => {
            Some(format!("transient failure: HTTP {s}"))
        }
        OutcomeKind::TransientFailure { status: None } => {
            Some("transient failure: network error".to_string())
        }
        OutcomeKind::PermanentFailure { status } => {
            Some(format!("permanent failure: HTTP {status}"))
        }
        OutcomeKind::Timeout => Some("attempt timed out".to_string()),
    }
}
