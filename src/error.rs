use thiserror::Error;

use crate::types::SigningActorId;

/// Errors returned when enqueueing work fails *before* delivery begins.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// Engine has been shut down.
    #[error("delivery engine is shut down")]
    Shutdown,

    /// The ledger rejected the durable write.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Infrastructure faults from the delivery ledger.
///
/// These are systemic, not per-envelope: the claim loop backs off and
/// retries at the component level rather than attributing the fault to
/// any single delivery.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger record could not be (de)serialized: {0}")]
    Serialization(String),
}

/// Failures raised by the outbound transport before a status code exists.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),
}

/// Failures raised while signing an outbound request.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("no signing key for actor {0:?}")]
    UnknownActor(SigningActorId),
}

/// Classified result of one HTTP delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeKind {
    /// 2xx response.
    Success,
    /// Retryable: 408, 429, 5xx, or a network-level error.
    TransientFailure { status: Option<u16> },
    /// Non-retryable: 4xx other than 408/429.
    PermanentFailure { status: u16 },
    /// The per-attempt timeout elapsed.
    Timeout,
}

impl OutcomeKind {
    /// Whether the outcome counts against the host's health. Permanent
    /// rejections prove the host responded, so only transient failures
    /// and timeouts qualify.
    pub fn is_host_failure(&self) -> bool {
        matches!(
            self,
            OutcomeKind::TransientFailure { .. } | OutcomeKind::Timeout
        )
    }
}

/// One attempt's outcome plus timing, handed to the retry scheduler and
/// the host health tracker. Transient; never persisted.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub kind: OutcomeKind,
    pub latency_ms: u64,
    pub responded_at_ms: u64,
}

/// Map an HTTP status to an outcome class.
///
/// 2xx is success; 408 and 429 are retryable despite being 4xx; all other
/// 4xx are permanent refusals; everything else (5xx, odd 1xx/3xx) is
/// treated as transient.
pub fn classify_status(status: u16) -> OutcomeKind {
    match status {
        200..=299 => OutcomeKind::Success,
        408 | 429 => OutcomeKind::TransientFailure {
            status: Some(status),
        },
        400..=499 => OutcomeKind::PermanentFailure { status },
        _ => OutcomeKind::TransientFailure {
            status: Some(status),
        },
    }
}
