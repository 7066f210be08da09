use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::error::{classify_status, DeliveryOutcome, OutcomeKind, TransportError};
use crate::signing::{http_date, payload_digest, request_target, Signer, SigningRequest};
use crate::types::{now_ms, ClaimedEnvelope};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "tracing")]
fn trace_warn(message: &'static str, detail: &str) {
    tracing::warn!(detail, "{message}");
}

#[cfg(not(feature = "tracing"))]
fn trace_warn(_message: &'static str, _detail: &str) {}

/// Result of a single delivery attempt, reported to the scheduler.
#[derive(Debug)]
pub struct DeliveryReport {
    pub claimed: ClaimedEnvelope,
    pub outcome: DeliveryOutcome,
    /// Whether the attempt reached the transport. Local faults (a
    /// missing signing key) never contacted the host and must not feed
    /// its health record.
    pub attempted: bool,
}

/// Sends one signed POST. Trait seam so tests can script remote behavior
/// without a network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `body` to `url` with `headers`, bounded by `timeout`.
    /// Returns the HTTP status, or a transport-level failure.
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &[u8],
        timeout: Duration,
    ) -> Result<u16, TransportError>;
}

/// reqwest-backed transport for real deliveries.
#[cfg(feature = "http")]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "http")]
impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &[u8],
        timeout: Duration,
    ) -> Result<u16, TransportError> {
        let mut request = self
            .client
            .post(url)
            .body(body.to_vec())
            .timeout(timeout);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) => Ok(response.status().as_u16()),
            Err(err) if err.is_timeout() => Err(TransportError::Timeout),
            Err(err) => Err(TransportError::Network(err.to_string())),
        }
    }
}

/// Shared, read-only context for all workers.
pub struct WorkerContext {
    pub transport: Arc<dyn Transport>,
    pub signer: Arc<dyn Signer>,
    /// Hard per-attempt bound; a slow host cannot hold a worker slot
    /// past this.
    pub attempt_timeout: Duration,
    /// Reports from workers to the scheduler.
    pub report_tx: mpsc::Sender<DeliveryReport>,
}

/// Main worker loop.
///
/// Workers pull claimed envelopes from the shared queue, perform one
/// signed HTTP attempt each, and report the classified outcome. They never
/// touch the ledger; every state change goes through the scheduler.
pub async fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<ClaimedEnvelope>>>, ctx: Arc<WorkerContext>) {
    loop {
        let claimed = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(claimed) = claimed else { break };

        let report = attempt_delivery(claimed, &ctx).await;
        if ctx.report_tx.send(report).await.is_err() {
            break;
        }
    }
}

/// Perform one signed delivery attempt and classify the result.
async fn attempt_delivery(claimed: ClaimedEnvelope, ctx: &WorkerContext) -> DeliveryReport {
    let started = Instant::now();
    let sent_at_ms = now_ms();

    let date = http_date(sent_at_ms);
    let digest = payload_digest(&claimed.payload);

    let mut headers: Vec<(String, String)> = vec![
        ("Host".to_string(), claimed.envelope.inbox.host.clone()),
        ("Date".to_string(), date.clone()),
        ("Digest".to_string(), digest.clone()),
        (
            "Content-Type".to_string(),
            "application/activity+json".to_string(),
        ),
        // Lets idempotent receivers drop redelivered attempts.
        (
            "X-Activity-Id".to_string(),
            claimed.envelope.activity_id.0.clone(),
        ),
    ];

    let signing_request = SigningRequest {
        actor: claimed.envelope.signing_actor.clone(),
        method: "post".to_string(),
        request_target: request_target(&claimed.envelope.inbox.url),
        host: claimed.envelope.inbox.host.clone(),
        date,
        digest,
    };

    match ctx.signer.sign(&signing_request) {
        Ok(signature_headers) => headers.extend(signature_headers),
        Err(err) => {
            // Local fault: the actor's key may be mid-rotation. The
            // envelope rides the normal backoff, but no request went
            // out, so the host is not charged.
            trace_warn("delivery.signing_failed", &err.to_string());
            metric_inc("fanout.delivery.signing_failed");
            return DeliveryReport {
                claimed,
                outcome: DeliveryOutcome {
                    kind: OutcomeKind::TransientFailure { status: None },
                    latency_ms: 0,
                    responded_at_ms: sent_at_ms,
                },
                attempted: false,
            };
        }
    }

    let result = ctx
        .transport
        .post(
            &claimed.envelope.inbox.url,
            &headers,
            &claimed.payload,
            ctx.attempt_timeout,
        )
        .await;

    let latency_ms = started.elapsed().as_millis() as u64;
    let kind = match result {
        Ok(status) => classify_status(status),
        Err(TransportError::Timeout) => OutcomeKind::Timeout,
        Err(TransportError::Network(detail)) => {
            trace_warn("delivery.network_error", &detail);
            OutcomeKind::TransientFailure { status: None }
        }
    };

    match kind {
        OutcomeKind::Success => metric_inc("fanout.delivery.success"),
        _ => metric_inc("fanout.delivery.failure"),
    }

    DeliveryReport {
        claimed,
        outcome: DeliveryOutcome {
            kind,
            latency_ms,
            responded_at_ms: now_ms(),
        },
        attempted: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::HmacSigner;
    use crate::types::{Activity, ActivityId, Envelope, RemoteInbox, SigningActorId};
    use std::sync::Mutex as StdMutex;

    struct ScriptedTransport {
        statuses: StdMutex<Vec<Result<u16, TransportError>>>,
        seen_headers: StdMutex<Vec<Vec<(String, String)>>>,
    }

    impl ScriptedTransport {
        fn new(statuses: Vec<Result<u16, TransportError>>) -> Self {
            Self {
                statuses: StdMutex::new(statuses),
                seen_headers: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post(
            &self,
            _url: &str,
            headers: &[(String, String)],
            _body: &[u8],
            _timeout: Duration,
        ) -> Result<u16, TransportError> {
            self.seen_headers.lock().unwrap().push(headers.to_vec());
            self.statuses.lock().unwrap().remove(0)
        }
    }

    fn claimed() -> ClaimedEnvelope {
        let activity = Activity::new("https://local.example/a1", br#"{"type":"Create"}"#.to_vec());
        let envelope = Envelope::build(
            ActivityId(activity.id.0.clone()),
            RemoteInbox::from_url("https://h1.example/inbox", true).unwrap(),
            SigningActorId("actor".into()),
            0,
        );
        ClaimedEnvelope {
            envelope,
            payload: activity.payload,
        }
    }

    fn context(transport: Arc<dyn Transport>) -> (Arc<WorkerContext>, mpsc::Receiver<DeliveryReport>) {
        let (report_tx, report_rx) = mpsc::channel(8);
        let ctx = Arc::new(WorkerContext {
            transport,
            signer: Arc::new(HmacSigner::new().with_key("actor", b"key".to_vec())),
            attempt_timeout: Duration::from_secs(10),
            report_tx,
        });
        (ctx, report_rx)
    }

    #[tokio::test]
    async fn successful_attempt_is_classified_and_signed() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(202)]));
        let (ctx, _rx) = context(transport.clone());

        let report = attempt_delivery(claimed(), &ctx).await;
        assert_eq!(report.outcome.kind, OutcomeKind::Success);
        assert!(report.attempted);

        let headers = transport.seen_headers.lock().unwrap();
        let names: Vec<&str> = headers[0].iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"Date"));
        assert!(names.contains(&"Digest"));
        assert!(names.contains(&"Signature"));
        assert!(names.contains(&"X-Activity-Id"));
    }

    #[tokio::test]
    async fn timeout_maps_to_timeout_outcome() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(TransportError::Timeout)]));
        let (ctx, _rx) = context(transport);
        let report = attempt_delivery(claimed(), &ctx).await;
        assert_eq!(report.outcome.kind, OutcomeKind::Timeout);
    }

    #[tokio::test]
    async fn network_error_is_transient() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(TransportError::Network(
            "connection refused".into(),
        ))]));
        let (ctx, _rx) = context(transport);
        let report = attempt_delivery(claimed(), &ctx).await;
        assert_eq!(
            report.outcome.kind,
            OutcomeKind::TransientFailure { status: None }
        );
    }

    #[tokio::test]
    async fn missing_signing_key_is_transient_without_an_attempt() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let (report_tx, _rx) = mpsc::channel(8);
        let ctx = Arc::new(WorkerContext {
            transport: transport.clone(),
            signer: Arc::new(HmacSigner::new()),
            attempt_timeout: Duration::from_secs(10),
            report_tx,
        });

        let report = attempt_delivery(claimed(), &ctx).await;
        assert_eq!(
            report.outcome.kind,
            OutcomeKind::TransientFailure { status: None }
        );
        assert!(!report.attempted);
        assert!(transport.seen_headers.lock().unwrap().is_empty());
    }
}
