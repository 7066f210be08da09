//! The delivery ledger: durable record of every envelope's lifecycle.
//!
//! The ledger is the single source of truth and the durability boundary.
//! Enqueue returns only after the envelope is recorded; a crash between
//! "HTTP attempt sent" and "outcome recorded" is recovered through lease
//! expiry, which re-surfaces the envelope as a transient failure. All
//! state changes go through a compare-and-swap `transition`, so concurrent
//! claim attempts from multiple workers (or multiple dispatcher processes
//! sharing one backend) are safe.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::LedgerError;
use crate::types::{
    Activity, ActivityId, ClaimedEnvelope, Envelope, EnvelopeId, EnvelopeState,
};

/// Parameters for one batch claim.
#[derive(Debug, Default, Clone)]
pub struct ClaimRequest {
    /// Max envelopes to claim in this batch.
    pub limit: usize,
    /// Max concurrent InFlight envelopes per destination host.
    pub per_host_cap: usize,
    pub now_ms: u64,
    /// Lease duration granted to the claimer.
    pub lease_ms: u64,
    /// Hosts with an open circuit; their envelopes stay Pending.
    pub skip_hosts: HashSet<String>,
    /// Hosts in HalfOpen; claim at most one envelope as the probe.
    pub probe_hosts: HashSet<String>,
}

/// Field updates applied together with a state transition.
///
/// The lease is cleared on every transition unless `lease_expires_ms`
/// grants a new one.
#[derive(Debug, Default, Clone)]
pub struct TransitionUpdate {
    pub attempt: Option<u32>,
    pub not_before_ms: Option<u64>,
    pub last_error: Option<String>,
    pub lease_expires_ms: Option<u64>,
}

/// Durable envelope store with atomic state transitions.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Record an activity payload so claimed envelopes can carry it.
    async fn insert_activity(&self, activity: &Activity) -> Result<(), LedgerError>;

    /// Insert an envelope unless one already exists for its
    /// `(activity_id, inbox.url)` key. Returns the surviving envelope's
    /// id either way; a duplicate insert is a no-op.
    async fn insert_if_absent(&self, envelope: &Envelope) -> Result<EnvelopeId, LedgerError>;

    /// Atomically claim ready envelopes: Pending, `not_before` elapsed,
    /// ordered oldest-ready-first, honoring the per-host cap and the
    /// skip/probe host sets. Claimed envelopes move to InFlight under a
    /// lease.
    async fn claim_ready(&self, req: &ClaimRequest) -> Result<Vec<ClaimedEnvelope>, LedgerError>;

    /// Compare-and-swap state transition. Returns `false` without any
    /// change when the envelope is missing or not in `expected` state;
    /// terminal exclusivity follows from terminal states never being an
    /// `expected` value.
    async fn transition(
        &self,
        id: EnvelopeId,
        expected: EnvelopeState,
        next: EnvelopeState,
        update: &TransitionUpdate,
    ) -> Result<bool, LedgerError>;

    /// Distinct hosts that currently have at least one ready Pending
    /// envelope. The claim loop gates each through the host health
    /// tracker before building its claim request.
    async fn ready_hosts(&self, now_ms: u64) -> Result<Vec<String>, LedgerError>;

    /// InFlight envelopes whose lease has expired. Used by the startup
    /// reconciliation scan and the periodic sweep; each is fed back
    /// through the retry policy as a transient failure.
    async fn expired_leases(&self, now_ms: u64) -> Result<Vec<Envelope>, LedgerError>;

    /// All envelopes for an activity, for cancellation and status queries.
    async fn envelopes_for_activity(
        &self,
        activity_id: &ActivityId,
    ) -> Result<Vec<Envelope>, LedgerError>;

    /// Fetch a single envelope.
    async fn get(&self, id: EnvelopeId) -> Result<Option<Envelope>, LedgerError>;
}

#[derive(Default)]
struct Tables {
    activities: HashMap<ActivityId, Vec<u8>>,
    envelopes: HashMap<EnvelopeId, Envelope>,
    /// Uniqueness index on (activity id, inbox URL).
    by_key: HashMap<(ActivityId, String), EnvelopeId>,
}

/// In-memory ledger for single-process deployments and tests.
///
/// Durable across the engine's restart only insofar as the process keeps
/// the instance alive; production deployments use the postgres backend.
#[derive(Default)]
pub struct InMemoryLedger {
    tables: Mutex<Tables>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn insert_activity(&self, activity: &Activity) -> Result<(), LedgerError> {
        let mut tables = self.tables.lock().await;
        tables
            .activities
            .entry(activity.id.clone())
            .or_insert_with(|| activity.payload.clone());
        Ok(())
    }

    async fn insert_if_absent(&self, envelope: &Envelope) -> Result<EnvelopeId, LedgerError> {
        let mut tables = self.tables.lock().await;
        let key = (envelope.activity_id.clone(), envelope.inbox.url.clone());
        if let Some(existing) = tables.by_key.get(&key) {
            return Ok(*existing);
        }
        tables.by_key.insert(key, envelope.id);
        tables.envelopes.insert(envelope.id, envelope.clone());
        Ok(envelope.id)
    }

    async fn claim_ready(&self, req: &ClaimRequest) -> Result<Vec<ClaimedEnvelope>, LedgerError> {
        let mut tables = self.tables.lock().await;

        let mut in_flight_per_host: HashMap<String, usize> = HashMap::new();
        for envelope in tables.envelopes.values() {
            if envelope.state == EnvelopeState::InFlight {
                *in_flight_per_host
                    .entry(envelope.inbox.host.clone())
                    .or_default() += 1;
            }
        }

        let mut ready: Vec<EnvelopeId> = tables
            .envelopes
            .values()
            .filter(|e| e.state == EnvelopeState::Pending && e.not_before_ms <= req.now_ms)
            .map(|e| e.id)
            .collect();
        ready.sort_by_key(|id| {
            let e = &tables.envelopes[id];
            (e.not_before_ms, e.id.0)
        });

        let mut probed: HashSet<String> = HashSet::new();
        let mut claimed = Vec::new();

        for id in ready {
            if claimed.len() >= req.limit {
                break;
            }

            let host = tables.envelopes[&id].inbox.host.clone();
            if req.skip_hosts.contains(&host) {
                continue;
            }
            let in_flight = in_flight_per_host.get(&host).copied().unwrap_or(0);
            if req.probe_hosts.contains(&host) {
                // One probe attempt, and only while nothing else is in
                // flight for the host.
                if in_flight > 0 || probed.contains(&host) {
                    continue;
                }
                probed.insert(host.clone());
            } else if req.per_host_cap > 0 && in_flight >= req.per_host_cap {
                continue;
            }

            let Some(payload) = tables
                .activities
                .get(&tables.envelopes[&id].activity_id)
                .cloned()
            else {
                continue;
            };

            let envelope = tables.envelopes.get_mut(&id).expect("claimed id");
            envelope.state = EnvelopeState::InFlight;
            envelope.lease_expires_ms = Some(req.now_ms + req.lease_ms);
            *in_flight_per_host.entry(host).or_default() += 1;

            claimed.push(ClaimedEnvelope {
                envelope: envelope.clone(),
                payload,
            });
        }

        Ok(claimed)
    }

    async fn transition(
        &self,
        id: EnvelopeId,
        expected: EnvelopeState,
        next: EnvelopeState,
        update: &TransitionUpdate,
    ) -> Result<bool, LedgerError> {
        let mut tables = self.tables.lock().await;
        let Some(envelope) = tables.envelopes.get_mut(&id) else {
            return Ok(false);
        };
        // Terminal states are final regardless of what the caller expected.
        if envelope.state.is_terminal() || envelope.state != expected {
            return Ok(false);
        }

        envelope.state = next;
        envelope.lease_expires_ms = update.lease_expires_ms;
        if let Some(attempt) = update.attempt {
            envelope.attempt = attempt;
        }
        if let Some(not_before) = update.not_before_ms {
            envelope.not_before_ms = not_before;
        }
        if let Some(ref error) = update.last_error {
            envelope.last_error = Some(error.clone());
        }
        Ok(true)
    }

    async fn ready_hosts(&self, now_ms: u64) -> Result<Vec<String>, LedgerError> {
        let tables = self.tables.lock().await;
        let mut hosts: Vec<String> = tables
            .envelopes
            .values()
            .filter(|e| e.state == EnvelopeState::Pending && e.not_before_ms <= now_ms)
            .map(|e| e.inbox.host.clone())
            .collect();
        hosts.sort();
        hosts.dedup();
        Ok(hosts)
    }

    async fn expired_leases(&self, now_ms: u64) -> Result<Vec<Envelope>, LedgerError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .envelopes
            .values()
            .filter(|e| {
                e.state == EnvelopeState::InFlight
                    && e.lease_expires_ms.is_some_and(|lease| lease <= now_ms)
            })
            .cloned()
            .collect())
    }

    async fn envelopes_for_activity(
        &self,
        activity_id: &ActivityId,
    ) -> Result<Vec<Envelope>, LedgerError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .envelopes
            .values()
            .filter(|e| &e.activity_id == activity_id)
            .cloned()
            .collect())
    }

    async fn get(&self, id: EnvelopeId) -> Result<Option<Envelope>, LedgerError> {
        let tables = self.tables.lock().await;
        Ok(tables.envelopes.get(&id).cloned())
    }
}
