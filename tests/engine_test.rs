use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use activity_fanout::{
    Activity, ActivityClass, ActivityId, CircuitState, ClaimRequest, DeliveryEvent, EngineConfig,
    EnvelopeState, FanoutEngine, HealthConfig, HmacSigner, InMemoryLedger, Ledger, Recipient,
    RetryPolicy, SigningActorId, Transport, TransportError,
};

/// Scripted transport: per-URL response queues with a default, recording
/// every call.
struct MockTransport {
    responses: Mutex<HashMap<String, Vec<Result<u16, TransportError>>>>,
    default_status: u16,
    calls: Mutex<Vec<String>>,
}

impl MockTransport {
    fn new(default_status: u16) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(HashMap::new()),
            default_status,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn script(&self, url: &str, responses: Vec<Result<u16, TransportError>>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), responses);
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn post(
        &self,
        url: &str,
        _headers: &[(String, String)],
        _body: &[u8],
        _timeout: Duration,
    ) -> Result<u16, TransportError> {
        self.calls.lock().unwrap().push(url.to_string());
        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(url) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => Ok(self.default_status),
        }
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        worker_count: 4,
        claim_interval_ms: 20,
        lease_ms: 60_000,
        retry: RetryPolicy {
            base_ms: 1,
            cap_ms: 50,
            max_attempts: 16,
            jitter: false,
        },
        ..EngineConfig::default()
    }
}

fn start(
    config: EngineConfig,
    transport: Arc<MockTransport>,
) -> (
    FanoutEngine,
    tokio::sync::mpsc::Receiver<DeliveryEvent>,
    Arc<InMemoryLedger>,
) {
    let ledger = Arc::new(InMemoryLedger::new());
    let signer = Arc::new(HmacSigner::new().with_key("actor", b"key".to_vec()));
    let (engine, events) = FanoutEngine::new(config, ledger.clone(), signer, transport);
    (engine, events, ledger)
}

async fn next_event(events: &mut tokio::sync::mpsc::Receiver<DeliveryEvent>) -> DeliveryEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for delivery event")
        .expect("event channel closed")
}

async fn assert_no_event(events: &mut tokio::sync::mpsc::Receiver<DeliveryEvent>) {
    assert!(
        timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err(),
        "unexpected extra delivery event"
    );
}

#[tokio::test]
async fn successful_delivery_fires_one_callback() {
    let transport = MockTransport::new(202);
    let (mut engine, mut events, _ledger) = start(fast_config(), transport.clone());

    let recipients = vec![Recipient::new("alice", "https://h1.example/users/alice/inbox")];
    let ids = engine
        .enqueue_delivery(
            Activity::new("a1", br#"{"type":"Create"}"#.to_vec()),
            ActivityClass::Public,
            &recipients,
            SigningActorId("actor".into()),
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let event = next_event(&mut events).await;
    assert_eq!(event.state, EnvelopeState::Succeeded);
    assert_eq!(event.attempts, 1);
    assert_eq!(event.activity_id, ActivityId("a1".into()));

    let envelope = engine.envelope(ids[0]).await.unwrap().unwrap();
    assert_eq!(envelope.state, EnvelopeState::Succeeded);

    assert_no_event(&mut events).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn duplicate_enqueue_is_idempotent() {
    let transport = MockTransport::new(202);
    let (mut engine, mut events, _ledger) = start(fast_config(), transport.clone());

    let recipients = vec![Recipient::new("alice", "https://h1.example/users/alice/inbox")];
    let activity = Activity::new("a1", b"{}".to_vec());

    let first = engine
        .enqueue_delivery(
            activity.clone(),
            ActivityClass::Public,
            &recipients,
            SigningActorId("actor".into()),
        )
        .await
        .unwrap();
    let second = engine
        .enqueue_delivery(
            activity,
            ActivityClass::Public,
            &recipients,
            SigningActorId("actor".into()),
        )
        .await
        .unwrap();
    assert_eq!(first, second);

    let event = next_event(&mut events).await;
    assert_eq!(event.state, EnvelopeState::Succeeded);
    assert_no_event(&mut events).await;

    assert_eq!(
        engine
            .activity_status(&ActivityId("a1".into()))
            .await
            .unwrap()
            .len(),
        1
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn transient_failure_retries_until_success() {
    let transport = MockTransport::new(202);
    let url = "https://h1.example/inbox";
    transport.script(url, vec![Ok(503), Ok(503), Ok(201)]);
    let (mut engine, mut events, _ledger) = start(fast_config(), transport.clone());

    let recipients = vec![
        Recipient::new("alice", "https://h1.example/users/alice/inbox")
            .with_shared_inbox(url),
    ];
    engine
        .enqueue_delivery(
            Activity::new("a1", b"{}".to_vec()),
            ActivityClass::Public,
            &recipients,
            SigningActorId("actor".into()),
        )
        .await
        .unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.state, EnvelopeState::Succeeded);
    assert_eq!(event.attempts, 3);
    assert_eq!(transport.calls_for(url), 3);
    assert_no_event(&mut events).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let transport = MockTransport::new(202);
    let url = "https://gone.example/users/bob/inbox";
    transport.script(url, vec![Ok(410)]);
    let (mut engine, mut events, _ledger) = start(fast_config(), transport.clone());

    engine
        .enqueue_delivery(
            Activity::new("a1", b"{}".to_vec()),
            ActivityClass::Public,
            &[Recipient::new("bob", url)],
            SigningActorId("actor".into()),
        )
        .await
        .unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.state, EnvelopeState::PermanentlyFailed);
    assert_eq!(event.attempts, 1);
    assert_eq!(event.last_error.as_deref(), Some("permanent failure: HTTP 410"));
    assert_eq!(transport.calls_for(url), 1);
    assert_no_event(&mut events).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_abandon_the_envelope() {
    let transport = MockTransport::new(503);
    let mut config = fast_config();
    config.retry.max_attempts = 3;
    let (mut engine, mut events, _ledger) = start(config, transport.clone());

    let url = "https://flaky.example/inbox";
    engine
        .enqueue_delivery(
            Activity::new("a1", b"{}".to_vec()),
            ActivityClass::Public,
            &[Recipient::new("carol", url)],
            SigningActorId("actor".into()),
        )
        .await
        .unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.state, EnvelopeState::Abandoned);
    assert_eq!(event.attempts, 3);
    assert_eq!(transport.calls_for(url), 3);
    assert_no_event(&mut events).await;
    engine.shutdown().await;
}

/// The worked example: three recipients behind one shared inbox plus one
/// personal inbox; the shared inbox 503s and is rescheduled with backoff,
/// the personal inbox succeeds immediately.
#[tokio::test]
async fn shared_inbox_fanout_scenario() {
    let transport = MockTransport::new(201);
    transport.script("https://h1.example/inbox", vec![Ok(503)]);

    let mut config = fast_config();
    // Large base so the h1 retry stays Pending for the test's duration.
    config.retry.base_ms = 60_000;
    config.retry.cap_ms = 24 * 60 * 60 * 1_000;
    let (mut engine, mut events, _ledger) = start(config, transport.clone());

    let recipients = vec![
        Recipient::new("alice", "https://h1.example/users/alice/inbox")
            .with_shared_inbox("https://h1.example/inbox"),
        Recipient::new("bob", "https://h1.example/users/bob/inbox")
            .with_shared_inbox("https://h1.example/inbox"),
        Recipient::new("carol", "https://h1.example/users/carol/inbox")
            .with_shared_inbox("https://h1.example/inbox"),
        Recipient::new("dave", "https://h2.example/users/dave/inbox"),
    ];

    let ids = engine
        .enqueue_delivery(
            Activity::new("a1", b"{}".to_vec()),
            ActivityClass::Public,
            &recipients,
            SigningActorId("actor".into()),
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    // Personal inbox delivery succeeds and is the only terminal event.
    let event = next_event(&mut events).await;
    assert_eq!(event.state, EnvelopeState::Succeeded);
    assert_eq!(event.inbox.url, "https://h2.example/users/dave/inbox");
    assert_no_event(&mut events).await;

    // Shared-inbox envelope is Pending again with backoff applied.
    let envelopes = engine.activity_status(&ActivityId("a1".into())).await.unwrap();
    let shared = envelopes
        .iter()
        .find(|e| e.inbox.url == "https://h1.example/inbox")
        .unwrap();
    assert_eq!(shared.state, EnvelopeState::Pending);
    assert_eq!(shared.attempt, 1);
    assert!(shared.not_before_ms > shared.created_at_ms + 30_000);
    engine.shutdown().await;
}

#[tokio::test]
async fn circuit_opens_then_probe_recovers_and_backlog_drains() {
    let transport = MockTransport::new(202);
    let down = "https://down.example";
    transport.script(&format!("{down}/u/0"), vec![Ok(503)]);
    transport.script(&format!("{down}/u/1"), vec![Ok(503)]);

    let mut config = fast_config();
    config.per_host_cap = 1;
    // Large per-envelope backoff so circuit recovery, not retry timing,
    // drains the backlog.
    config.retry.base_ms = 60_000;
    config.health = HealthConfig {
        threshold: 2,
        cooldown_ms: 400,
        max_cooldown_ms: 3_200,
        ..HealthConfig::default()
    };
    let (mut engine, mut events, _ledger) = start(config, transport.clone());

    let recipients: Vec<Recipient> = (0..4)
        .map(|i| Recipient::new(format!("u{i}"), format!("{down}/u/{i}")))
        .collect();
    engine
        .enqueue_delivery(
            Activity::new("a1", b"{}".to_vec()),
            ActivityClass::Public,
            &recipients,
            SigningActorId("actor".into()),
        )
        .await
        .unwrap();

    // Two failures open the circuit; the remaining envelopes must not be
    // attempted while it is open.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(engine.health().circuit_state("down.example"), Some(CircuitState::Open));
    assert_eq!(transport.call_count(), 2);

    // After the cooldown one probe goes out, succeeds, closes the
    // circuit, and the ready backlog drains without waiting out the
    // envelopes' own backoff.
    let first = next_event(&mut events).await;
    assert_eq!(first.state, EnvelopeState::Succeeded);
    let second = next_event(&mut events).await;
    assert_eq!(second.state, EnvelopeState::Succeeded);
    assert_eq!(engine.health().circuit_state("down.example"), Some(CircuitState::Closed));
    engine.shutdown().await;
}

#[tokio::test]
async fn signing_failure_does_not_charge_the_remote_host() {
    let transport = MockTransport::new(202);
    let mut config = fast_config();
    config.health = HealthConfig {
        threshold: 2,
        ..HealthConfig::default()
    };

    // No key registered for the signing actor: every attempt fails
    // locally, before anything goes on the wire.
    let ledger = Arc::new(InMemoryLedger::new());
    let signer = Arc::new(HmacSigner::new());
    let (mut engine, mut events) =
        FanoutEngine::new(config, ledger.clone(), signer, transport.clone());

    let recipients: Vec<Recipient> = (0..4)
        .map(|i| Recipient::new(format!("u{i}"), format!("https://healthy.example/u/{i}")))
        .collect();
    engine
        .enqueue_delivery(
            Activity::new("a1", b"{}".to_vec()),
            ActivityClass::Public,
            &recipients,
            SigningActorId("actor".into()),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    // The host was never contacted, so its circuit must be untouched
    // and the envelopes keep riding their backoff.
    assert_eq!(transport.call_count(), 0);
    assert_eq!(engine.health().circuit_state("healthy.example"), None);
    let envelopes = engine.activity_status(&ActivityId("a1".into())).await.unwrap();
    assert!(envelopes.iter().all(|e| !e.state.is_terminal()));
    assert!(envelopes.iter().all(|e| e.attempt >= 1));
    assert_no_event(&mut events).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn cancel_abandons_pending_envelopes() {
    let transport = MockTransport::new(503);
    let mut config = fast_config();
    // First attempt fails, long backoff keeps the envelope Pending.
    config.retry.base_ms = 60_000;
    let (mut engine, mut events, _ledger) = start(config, transport.clone());

    let url = "https://h1.example/inbox";
    engine
        .enqueue_delivery(
            Activity::new("a1", b"{}".to_vec()),
            ActivityClass::Public,
            &[Recipient::new("alice", url)],
            SigningActorId("actor".into()),
        )
        .await
        .unwrap();

    // Wait for the first attempt to fail and reschedule.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let envelopes = engine.activity_status(&ActivityId("a1".into())).await.unwrap();
        if envelopes[0].state == EnvelopeState::Pending && envelopes[0].attempt == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "first attempt never settled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let cancelled = engine.cancel_delivery(&ActivityId("a1".into())).await.unwrap();
    assert_eq!(cancelled, 1);

    let event = next_event(&mut events).await;
    assert_eq!(event.state, EnvelopeState::Abandoned);
    assert_eq!(event.last_error.as_deref(), Some("cancelled by application"));

    // Cancelling again is a no-op.
    assert_eq!(engine.cancel_delivery(&ActivityId("a1".into())).await.unwrap(), 0);
    assert_no_event(&mut events).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn expired_lease_is_reclaimed_and_delivered() {
    // Simulate a claim left behind by a crashed worker: lease it directly
    // on the ledger, then start an engine over the same ledger.
    let ledger = Arc::new(InMemoryLedger::new());
    let activity = Activity::new("a1", b"{}".to_vec());
    ledger.insert_activity(&activity).await.unwrap();

    let envelope = activity_fanout::Envelope::build(
        ActivityId("a1".into()),
        activity_fanout::RemoteInbox::from_url("https://h1.example/inbox", false).unwrap(),
        SigningActorId("actor".into()),
        0,
    );
    ledger.insert_if_absent(&envelope).await.unwrap();
    let claimed = ledger
        .claim_ready(&ClaimRequest {
            limit: 1,
            per_host_cap: 1,
            now_ms: 1,
            lease_ms: 1,
            ..ClaimRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let transport = MockTransport::new(202);
    let signer = Arc::new(HmacSigner::new().with_key("actor", b"key".to_vec()));
    let (mut engine, mut events) =
        FanoutEngine::new(fast_config(), ledger.clone(), signer, transport);

    // The stale lease (expired long ago) is reclaimed as a transient
    // failure, then redelivered.
    let event = next_event(&mut events).await;
    assert_eq!(event.state, EnvelopeState::Succeeded);
    assert_eq!(event.attempts, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn enqueue_after_shutdown_is_rejected() {
    let transport = MockTransport::new(202);
    let (mut engine, _events, _ledger) = start(fast_config(), transport);
    engine.shutdown().await;

    let result = engine
        .enqueue_delivery(
            Activity::new("a1", b"{}".to_vec()),
            ActivityClass::Public,
            &[Recipient::new("alice", "https://h1.example/inbox")],
            SigningActorId("actor".into()),
        )
        .await;
    assert!(matches!(result, Err(activity_fanout::EnqueueError::Shutdown)));
}
