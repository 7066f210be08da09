//! Postgres-backed ledger for multi-process deployments.
//!
//! Claims run inside a transaction with `FOR UPDATE SKIP LOCKED`, so any
//! number of dispatcher processes can share one database without double
//! leasing an envelope.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::{Client, Row};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::{ClaimRequest, Ledger, TransitionUpdate};
use crate::types::{
    Activity, ActivityId, ClaimedEnvelope, Envelope, EnvelopeId, EnvelopeState, RemoteInbox,
    SigningActorId,
};

pub struct PostgresLedger {
    // Transactions need exclusive access to the client.
    client: Mutex<Client>,
}

impl PostgresLedger {
    /// Wrap a connected client, creating the schema if needed.
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS fanout_activities (
                    id TEXT PRIMARY KEY,
                    payload BYTEA NOT NULL
                );
                CREATE TABLE IF NOT EXISTS fanout_envelopes (
                    id TEXT PRIMARY KEY,
                    activity_id TEXT NOT NULL,
                    inbox_url TEXT NOT NULL,
                    host TEXT NOT NULL,
                    shared BOOLEAN NOT NULL,
                    signing_actor TEXT NOT NULL,
                    state TEXT NOT NULL,
                    attempt INTEGER NOT NULL,
                    not_before_ms BIGINT NOT NULL,
                    lease_expires_ms BIGINT,
                    last_error TEXT,
                    created_at_ms BIGINT NOT NULL,
                    UNIQUE (activity_id, inbox_url)
                );
                CREATE INDEX IF NOT EXISTS fanout_envelopes_claim
                    ON fanout_envelopes (state, not_before_ms);",
            )
            .await?;

        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

fn state_to_str(state: EnvelopeState) -> &'static str {
    match state {
        EnvelopeState::Pending => "pending",
        EnvelopeState::InFlight => "in_flight",
        EnvelopeState::Succeeded => "succeeded",
        EnvelopeState::PermanentlyFailed => "permanently_failed",
        EnvelopeState::Abandoned => "abandoned",
    }
}

fn state_from_str(state: &str) -> Result<EnvelopeState, LedgerError> {
    match state {
        "pending" => Ok(EnvelopeState::Pending),
        "in_flight" => Ok(EnvelopeState::InFlight),
        "succeeded" => Ok(EnvelopeState::Succeeded),
        "permanently_failed" => Ok(EnvelopeState::PermanentlyFailed),
        "abandoned" => Ok(EnvelopeState::Abandoned),
        other => Err(LedgerError::Serialization(format!(
            "unknown envelope state {other:?}"
        ))),
    }
}

fn db_err(err: tokio_postgres::Error) -> LedgerError {
    LedgerError::Unavailable(err.to_string())
}

/// Columns selected for envelope rows, in `row_to_envelope` order.
const ENVELOPE_COLUMNS: &str = "id, activity_id, inbox_url, host, shared, signing_actor, \
     state, attempt, not_before_ms, lease_expires_ms, last_error, created_at_ms";

fn row_to_envelope(row: &Row) -> Result<Envelope, LedgerError> {
    let id: String = row.try_get(0).map_err(db_err)?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| LedgerError::Serialization(format!("bad envelope id: {e}")))?;
    let state: String = row.try_get(6).map_err(db_err)?;
    let attempt: i32 = row.try_get(7).map_err(db_err)?;
    let not_before_ms: i64 = row.try_get(8).map_err(db_err)?;
    let lease_expires_ms: Option<i64> = row.try_get(9).map_err(db_err)?;
    let created_at_ms: i64 = row.try_get(11).map_err(db_err)?;

    Ok(Envelope {
        id: EnvelopeId(id),
        activity_id: ActivityId(row.try_get(1).map_err(db_err)?),
        inbox: RemoteInbox {
            url: row.try_get(2).map_err(db_err)?,
            host: row.try_get(3).map_err(db_err)?,
            shared: row.try_get(4).map_err(db_err)?,
        },
        signing_actor: SigningActorId(row.try_get(5).map_err(db_err)?),
        state: state_from_str(&state)?,
        attempt: attempt as u32,
        not_before_ms: not_before_ms as u64,
        lease_expires_ms: lease_expires_ms.map(|v| v as u64),
        last_error: row.try_get(10).map_err(db_err)?,
        created_at_ms: created_at_ms as u64,
    })
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn insert_activity(&self, activity: &Activity) -> Result<(), LedgerError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO fanout_activities (id, payload)
                 VALUES ($1, $2)
                 ON CONFLICT (id) DO NOTHING",
                &[&activity.id.0, &activity.payload],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_if_absent(&self, envelope: &Envelope) -> Result<EnvelopeId, LedgerError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO fanout_envelopes
                     (id, activity_id, inbox_url, host, shared, signing_actor,
                      state, attempt, not_before_ms, lease_expires_ms, last_error, created_at_ms)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, NULL, $10)
                 ON CONFLICT (activity_id, inbox_url) DO NOTHING",
                &[
                    &envelope.id.0.to_string(),
                    &envelope.activity_id.0,
                    &envelope.inbox.url,
                    &envelope.inbox.host,
                    &envelope.inbox.shared,
                    &envelope.signing_actor.0,
                    &state_to_str(envelope.state),
                    &(envelope.attempt as i32),
                    &(envelope.not_before_ms as i64),
                    &(envelope.created_at_ms as i64),
                ],
            )
            .await
            .map_err(db_err)?;

        // Either our insert won or an envelope already existed for the
        // key; return whichever id survives.
        let row = client
            .query_one(
                "SELECT id FROM fanout_envelopes WHERE activity_id = $1 AND inbox_url = $2",
                &[&envelope.activity_id.0, &envelope.inbox.url],
            )
            .await
            .map_err(db_err)?;
        let id: String = row.try_get(0).map_err(db_err)?;
        let id = Uuid::parse_str(&id)
            .map_err(|e| LedgerError::Serialization(format!("bad envelope id: {e}")))?;
        Ok(EnvelopeId(id))
    }

    async fn claim_ready(&self, req: &ClaimRequest) -> Result<Vec<ClaimedEnvelope>, LedgerError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;

        let in_flight_rows = tx
            .query(
                "SELECT host, COUNT(*) FROM fanout_envelopes
                 WHERE state = 'in_flight' GROUP BY host",
                &[],
            )
            .await
            .map_err(db_err)?;
        let mut in_flight_per_host: std::collections::HashMap<String, usize> = in_flight_rows
            .into_iter()
            .map(|row| {
                let host: String = row.get(0);
                let count: i64 = row.get(1);
                (host, count as usize)
            })
            .collect();

        // Over-fetch candidates, then filter by host caps and circuit
        // gates application-side.
        let rows = tx
            .query(
                &format!(
                    "SELECT {ENVELOPE_COLUMNS} FROM fanout_envelopes
                     WHERE state = 'pending' AND not_before_ms <= $1
                     ORDER BY not_before_ms ASC
                     LIMIT $2
                     FOR UPDATE SKIP LOCKED"
                ),
                &[&(req.now_ms as i64), &((req.limit * 4).max(req.limit) as i64)],
            )
            .await
            .map_err(db_err)?;

        let mut probed: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut claimed_ids: Vec<String> = Vec::new();
        let mut claimed: Vec<Envelope> = Vec::new();

        for row in &rows {
            if claimed.len() >= req.limit {
                break;
            }
            let mut envelope = row_to_envelope(row)?;
            let host = envelope.inbox.host.clone();
            if req.skip_hosts.contains(&host) {
                continue;
            }
            let in_flight = in_flight_per_host.get(&host).copied().unwrap_or(0);
            if req.probe_hosts.contains(&host) {
                if in_flight > 0 || probed.contains(&host) {
                    continue;
                }
                probed.insert(host.clone());
            } else if req.per_host_cap > 0 && in_flight >= req.per_host_cap {
                continue;
            }

            envelope.state = EnvelopeState::InFlight;
            envelope.lease_expires_ms = Some(req.now_ms + req.lease_ms);
            *in_flight_per_host.entry(host).or_default() += 1;
            claimed_ids.push(envelope.id.0.to_string());
            claimed.push(envelope);
        }

        if !claimed_ids.is_empty() {
            tx.execute(
                "UPDATE fanout_envelopes
                 SET state = 'in_flight', lease_expires_ms = $1
                 WHERE id = ANY($2)",
                &[&((req.now_ms + req.lease_ms) as i64), &claimed_ids],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        let mut result = Vec::with_capacity(claimed.len());
        let client = &*client;
        for envelope in claimed {
            let row = client
                .query_one(
                    "SELECT payload FROM fanout_activities WHERE id = $1",
                    &[&envelope.activity_id.0],
                )
                .await
                .map_err(db_err)?;
            let payload: Vec<u8> = row.try_get(0).map_err(db_err)?;
            result.push(ClaimedEnvelope { envelope, payload });
        }
        Ok(result)
    }

    async fn transition(
        &self,
        id: EnvelopeId,
        expected: EnvelopeState,
        next: EnvelopeState,
        update: &TransitionUpdate,
    ) -> Result<bool, LedgerError> {
        if expected.is_terminal() {
            return Ok(false);
        }
        let client = self.client.lock().await;
        let updated = client
            .execute(
                "UPDATE fanout_envelopes
                 SET state = $1,
                     lease_expires_ms = $2,
                     attempt = COALESCE($3, attempt),
                     not_before_ms = COALESCE($4, not_before_ms),
                     last_error = COALESCE($5, last_error)
                 WHERE id = $6 AND state = $7",
                &[
                    &state_to_str(next),
                    &update.lease_expires_ms.map(|v| v as i64),
                    &update.attempt.map(|v| v as i32),
                    &update.not_before_ms.map(|v| v as i64),
                    &update.last_error,
                    &id.0.to_string(),
                    &state_to_str(expected),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(updated == 1)
    }

    async fn ready_hosts(&self, now_ms: u64) -> Result<Vec<String>, LedgerError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT DISTINCT host FROM fanout_envelopes
                 WHERE state = 'pending' AND not_before_ms <= $1",
                &[&(now_ms as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.into_iter()
            .map(|row| row.try_get(0).map_err(db_err))
            .collect()
    }

    async fn expired_leases(&self, now_ms: u64) -> Result<Vec<Envelope>, LedgerError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {ENVELOPE_COLUMNS} FROM fanout_envelopes
                     WHERE state = 'in_flight' AND lease_expires_ms <= $1"
                ),
                &[&(now_ms as i64)],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_envelope).collect()
    }

    async fn envelopes_for_activity(
        &self,
        activity_id: &ActivityId,
    ) -> Result<Vec<Envelope>, LedgerError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {ENVELOPE_COLUMNS} FROM fanout_envelopes WHERE activity_id = $1"
                ),
                &[&activity_id.0],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_envelope).collect()
    }

    async fn get(&self, id: EnvelopeId) -> Result<Option<Envelope>, LedgerError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!("SELECT {ENVELOPE_COLUMNS} FROM fanout_envelopes WHERE id = $1"),
                &[&id.0.to_string()],
            )
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_envelope).transpose()
    }
}
