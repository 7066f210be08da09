//! A fan-out and delivery engine for federated activities.
//!
//! The surrounding application creates activities (posts, likes, follows,
//! boosts, deletes) and knows which accounts should receive them; this
//! crate turns that into **signed HTTP deliveries to remote inboxes**,
//! with retry, backoff, per-host circuit breaking, and a durable ledger
//! of every envelope's lifecycle.
//!
//! ## Guarantees
//! - At-least-once delivery attempts, recovered across restarts via
//!   lease expiry
//! - Exactly-once effect at envelope granularity: one envelope per
//!   `(activity, inbox URL)` pair, idempotent enqueue
//! - Per-host concurrency caps and circuit breaking, so one slow or dead
//!   host cannot starve the pool
//! - Exactly one terminal event per envelope reported back to the
//!   application
//!
//! ## Non-Guarantees
//! - Activity authoring, validation, or payload construction
//! - Inbound delivery processing (a separate pipeline)
//! - Global delivery ordering across hosts; remote servers must tolerate
//!   any order
//! - Recalling an attempt already on the wire after cancellation
//!
//! ## Flow
//! `enqueue_delivery` resolves recipient accounts to distinct inboxes
//! (coalescing shared inboxes where the activity class allows), writes
//! one durable Pending envelope per inbox, and returns. The claim loop
//! leases ready envelopes oldest-first, respecting per-host caps and
//! circuit state, and hands them to the worker pool for signed POSTs.
//! Outcomes are classified and retried with capped exponential backoff
//! plus jitter, and every terminal state is reported once on the event
//! stream.

mod dispatcher;
mod error;
mod health;
mod ledger;
mod resolver;
mod retry;
mod signing;
mod types;
mod worker;

#[cfg(feature = "postgres")]
mod ledger_postgres;

pub use dispatcher::{EngineConfig, FanoutEngine};
pub use error::{
    classify_status, DeliveryOutcome, EnqueueError, LedgerError, OutcomeKind, SigningError,
    TransportError,
};
pub use health::{CircuitState, HealthConfig, HostGate, HostHealth, HostHealthTracker};
pub use ledger::{ClaimRequest, InMemoryLedger, Ledger, TransitionUpdate};
pub use resolver::{resolve, Resolution};
pub use retry::{Disposition, RetryPolicy};
pub use signing::{
    compute_signature, http_date, payload_digest, request_target, verify_signature, HmacSigner,
    Signer, SigningRequest,
};
pub use types::{
    AccountRef, Activity, ActivityClass, ActivityId, ClaimedEnvelope, DeliveryEvent, Envelope,
    EnvelopeId, EnvelopeState, Recipient, RemoteInbox, SigningActorId,
};
pub use worker::{DeliveryReport, Transport};

#[cfg(feature = "http")]
pub use worker::HttpTransport;

#[cfg(feature = "postgres")]
pub use ledger_postgres::PostgresLedger;
