use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::error::{EnqueueError, LedgerError, OutcomeKind};
use crate::health::{HealthConfig, HostGate, HostHealthTracker};
use crate::ledger::{ClaimRequest, Ledger, TransitionUpdate};
use crate::resolver::resolve;
use crate::retry::{describe_outcome, Disposition, RetryPolicy};
use crate::signing::Signer;
use crate::types::{
    now_ms, Activity, ActivityClass, ActivityId, DeliveryEvent, Envelope, EnvelopeId,
    EnvelopeState, Recipient, SigningActorId,
};
use crate::worker::{worker_loop, DeliveryReport, Transport, WorkerContext};

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

/// Engine configuration.
///
/// All knobs are data, not code: `from_env` reads `FANOUT_*` overrides so
/// deployments tune the engine without a rebuild.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool size (global outbound concurrency).
    pub worker_count: usize,
    /// Max envelopes claimed per scheduler tick.
    pub claim_batch: usize,
    /// Max concurrent in-flight envelopes per destination host.
    pub per_host_cap: usize,
    /// Lease granted on claim; an InFlight envelope past this is
    /// reclaimable.
    pub lease_ms: u64,
    /// Scheduler poll interval between notifies.
    pub claim_interval_ms: u64,
    /// Hard bound on one HTTP attempt (connect + read).
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
    pub health: HealthConfig,
    /// Buffer of the terminal-event channel handed to the application.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            claim_batch: 64,
            per_host_cap: 4,
            lease_ms: 120_000,
            claim_interval_ms: 1_000,
            attempt_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            health: HealthConfig::default(),
            event_buffer: 1_024,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `FANOUT_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("FANOUT_WORKERS") {
            config.worker_count = v;
        }
        if let Some(v) = env_parse("FANOUT_CLAIM_BATCH") {
            config.claim_batch = v;
        }
        if let Some(v) = env_parse("FANOUT_PER_HOST_CAP") {
            config.per_host_cap = v;
        }
        if let Some(v) = env_parse("FANOUT_LEASE_MS") {
            config.lease_ms = v;
        }
        if let Some(v) = env_parse("FANOUT_ATTEMPT_TIMEOUT_MS") {
            config.attempt_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("FANOUT_RETRY_BASE_MS") {
            config.retry.base_ms = v;
        }
        if let Some(v) = env_parse("FANOUT_RETRY_CAP_MS") {
            config.retry.cap_ms = v;
        }
        if let Some(v) = env_parse("FANOUT_MAX_ATTEMPTS") {
            config.retry.max_attempts = v;
        }
        if let Some(v) = env_parse("FANOUT_CIRCUIT_THRESHOLD") {
            config.health.threshold = v;
        }
        if let Some(v) = env_parse("FANOUT_CIRCUIT_COOLDOWN_MS") {
            config.health.cooldown_ms = v;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

/// The fan-out delivery engine.
///
/// Owns the worker pool and the scheduler task; the ledger is the only
/// shared mutable state, so several engine processes may share one
/// durable ledger backend.
pub struct FanoutEngine {
    config: EngineConfig,
    ledger: Arc<dyn Ledger>,
    health: Arc<HostHealthTracker>,
    is_running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    event_tx: mpsc::Sender<DeliveryEvent>,
    worker_handles: Vec<JoinHandle<()>>,
    scheduler_handle: Option<JoinHandle<()>>,
}

impl FanoutEngine {
    /// Start the engine: spawns the worker pool and the claim loop.
    /// Returns the engine and the terminal-outcome event stream.
    pub fn new(
        config: EngineConfig,
        ledger: Arc<dyn Ledger>,
        signer: Arc<dyn Signer>,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::Receiver<DeliveryEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (ready_tx, ready_rx) = mpsc::channel(config.claim_batch.max(1) * 2);
        let (report_tx, report_rx) = mpsc::channel(config.claim_batch.max(1) * 2);

        let ctx = Arc::new(WorkerContext {
            transport,
            signer,
            attempt_timeout: config.attempt_timeout,
            report_tx,
        });

        let shared_ready_rx = Arc::new(Mutex::new(ready_rx));
        let mut worker_handles = Vec::new();
        for _ in 0..config.worker_count.max(1) {
            worker_handles.push(tokio::spawn(worker_loop(shared_ready_rx.clone(), ctx.clone())));
        }

        let health = Arc::new(HostHealthTracker::new(config.health.clone()));
        let is_running = Arc::new(AtomicBool::new(true));
        let notify = Arc::new(Notify::new());

        let scheduler = SchedulerLoop {
            config: config.clone(),
            ledger: ledger.clone(),
            health: health.clone(),
            is_running: is_running.clone(),
            notify: notify.clone(),
            event_tx: event_tx.clone(),
            ready_tx,
            report_rx,
        };
        let scheduler_handle = tokio::spawn(scheduler.run());

        (
            Self {
                config,
                ledger,
                health,
                is_running,
                notify,
                event_tx,
                worker_handles,
                scheduler_handle: Some(scheduler_handle),
            },
            event_rx,
        )
    }

    /// Fan an activity out to its recipients.
    ///
    /// Resolves inboxes, writes one Pending envelope per inbox to the
    /// ledger (idempotently on `(activity_id, inbox.url)`), and wakes the
    /// claim loop. Returns the envelope ids, existing ones included, once
    /// the writes are durable.
    pub async fn enqueue_delivery(
        &self,
        activity: Activity,
        class: ActivityClass,
        recipients: &[Recipient],
        signing_actor: SigningActorId,
    ) -> Result<Vec<EnvelopeId>, EnqueueError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(EnqueueError::Shutdown);
        }

        let resolution = resolve(class, recipients);
        for account in &resolution.dropped {
            trace_warn("fanout.enqueue.unresolvable_recipient", &account.0);
            metric_inc("fanout.enqueue.dropped_recipient");
        }

        self.ledger.insert_activity(&activity).await?;

        let now = now_ms();
        let mut ids = Vec::with_capacity(resolution.inboxes.len());
        for inbox in resolution.inboxes {
            let envelope =
                Envelope::build(activity.id.clone(), inbox, signing_actor.clone(), now);
            let id = self.ledger.insert_if_absent(&envelope).await?;
            ids.push(id);
        }

        metric_inc("fanout.enqueue.accepted");
        self.notify.notify_one();
        Ok(ids)
    }

    /// Best-effort retraction of an activity's deliveries.
    ///
    /// Pending and InFlight envelopes move straight to Abandoned; an
    /// attempt already on the wire cannot be recalled, its late report
    /// loses the CAS and is discarded. Returns how many envelopes were
    /// actually cancelled.
    pub async fn cancel_delivery(&self, activity_id: &ActivityId) -> Result<usize, LedgerError> {
        let envelopes = self.ledger.envelopes_for_activity(activity_id).await?;
        let update = TransitionUpdate {
            last_error: Some("cancelled by application".to_string()),
            ..TransitionUpdate::default()
        };

        let mut cancelled = 0;
        for envelope in envelopes {
            if envelope.state.is_terminal() {
                continue;
            }
            let moved = self
                .ledger
                .transition(envelope.id, envelope.state, EnvelopeState::Abandoned, &update)
                .await?;
            if moved {
                cancelled += 1;
                metric_inc("fanout.cancelled");
                emit_event(
                    &self.event_tx,
                    &envelope,
                    EnvelopeState::Abandoned,
                    Some("cancelled by application".to_string()),
                    envelope.attempt,
                )
                .await;
            }
        }
        Ok(cancelled)
    }

    /// Fetch one envelope's current ledger record.
    pub async fn envelope(&self, id: EnvelopeId) -> Result<Option<Envelope>, LedgerError> {
        self.ledger.get(id).await
    }

    /// All envelope records for an activity.
    pub async fn activity_status(
        &self,
        activity_id: &ActivityId,
    ) -> Result<Vec<Envelope>, LedgerError> {
        self.ledger.envelopes_for_activity(activity_id).await
    }

    /// Host health observer, for operational introspection.
    pub fn health(&self) -> &HostHealthTracker {
        &self.health
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Retry/backoff policy in effect.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// Stop claiming, drain workers, and wait for them to exit.
    /// Outstanding InFlight leases recover via expiry on the next start.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();

        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.await;
        }
        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// The single scheduler task: reconcile leases, gate hosts, claim, feed
/// workers, and apply outcome reports.
struct SchedulerLoop {
    config: EngineConfig,
    ledger: Arc<dyn Ledger>,
    health: Arc<HostHealthTracker>,
    is_running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    event_tx: mpsc::Sender<DeliveryEvent>,
    ready_tx: mpsc::Sender<crate::types::ClaimedEnvelope>,
    report_rx: mpsc::Receiver<DeliveryReport>,
}

impl SchedulerLoop {
    async fn run(mut self) {
        // Component-level backoff for ledger faults; these are systemic,
        // never attributed to an envelope.
        let mut ledger_backoff_ms: u64 = 0;

        loop {
            if !self.is_running.load(Ordering::SeqCst) {
                // Dropping ready_tx closes the worker queue; workers
                // drain and exit.
                return;
            }

            match self.tick().await {
                Ok(()) => {
                    ledger_backoff_ms = 0;
                }
                Err(err) => {
                    ledger_backoff_ms = ((ledger_backoff_ms * 2).max(500)).min(30_000);
                    trace_warn("fanout.ledger.fault", &err.to_string());
                    metric_inc("fanout.ledger.fault");
                    sleep(Duration::from_millis(ledger_backoff_ms)).await;
                    continue;
                }
            }

            let report = tokio::select! {
                _ = self.notify.notified() => None,
                _ = sleep(Duration::from_millis(self.config.claim_interval_ms)) => None,
                report = self.report_rx.recv() => report,
            };
            if let Some(report) = report {
                self.handle_report(report).await;
            }
        }
    }

    async fn tick(&mut self) -> Result<(), LedgerError> {
        let now = now_ms();

        // Reclaim leases abandoned by crashed or stalled workers; each
        // counts as a transient failure.
        for envelope in self.ledger.expired_leases(now).await? {
            metric_inc("fanout.lease.reclaimed");
            self.health.record(
                &envelope.inbox.host,
                &OutcomeKind::Timeout,
                now,
            );
            self.apply_disposition(&envelope, &OutcomeKind::Timeout, now).await?;
        }

        // Gate hosts through their circuit breakers.
        let mut skip_hosts = HashSet::new();
        let mut probe_hosts = HashSet::new();
        for host in self.ledger.ready_hosts(now).await? {
            match self.health.gate(&host, now) {
                HostGate::Allow => {}
                HostGate::Skip => {
                    skip_hosts.insert(host);
                }
                HostGate::Probe => {
                    probe_hosts.insert(host);
                }
            }
        }

        let claimed = self
            .ledger
            .claim_ready(&ClaimRequest {
                limit: self.config.claim_batch,
                per_host_cap: self.config.per_host_cap,
                now_ms: now,
                lease_ms: self.config.lease_ms,
                skip_hosts,
                probe_hosts: probe_hosts.clone(),
            })
            .await?;

        // Probes that found nothing to claim hand their slot back.
        for host in &probe_hosts {
            if !claimed.iter().any(|c| &c.envelope.inbox.host == host) {
                self.health.release_probe(host);
            }
        }

        for claim in claimed {
            metric_inc("fanout.claimed");
            if self.ready_tx.send(claim).await.is_err() {
                return Ok(());
            }
        }

        // Apply any outcome reports that have queued up.
        while let Ok(report) = self.report_rx.try_recv() {
            self.handle_report(report).await;
        }

        Ok(())
    }

    async fn handle_report(&self, report: DeliveryReport) {
        let envelope = &report.claimed.envelope;
        let now = now_ms();

        // An outcome that never reached the network says nothing about
        // the remote host.
        if report.attempted {
            self.health
                .record(&envelope.inbox.host, &report.outcome.kind, now);
        }

        if let Err(err) = self
            .apply_disposition(envelope, &report.outcome.kind, now)
            .await
        {
            // The outcome is lost but the lease is not: expiry will
            // resurface the envelope as a transient failure.
            trace_warn("fanout.ledger.fault", &err.to_string());
            metric_inc("fanout.ledger.fault");
        }
    }

    /// Route one outcome through the retry policy and the ledger CAS.
    /// Emits the terminal event only on the winning transition.
    async fn apply_disposition(
        &self,
        envelope: &Envelope,
        kind: &OutcomeKind,
        now: u64,
    ) -> Result<(), LedgerError> {
        let error = describe_outcome(kind);
        let success_rate = self
            .health
            .snapshot(&envelope.inbox.host)
            .map(|h| h.success_rate)
            .unwrap_or(1.0);

        match self
            .config
            .retry
            .disposition(envelope, kind, now, success_rate)
        {
            Disposition::Terminal(state) => {
                let attempts = envelope.attempt + 1;
                let update = TransitionUpdate {
                    attempt: Some(attempts),
                    last_error: error.clone(),
                    ..TransitionUpdate::default()
                };
                let moved = self
                    .ledger
                    .transition(envelope.id, EnvelopeState::InFlight, state, &update)
                    .await?;
                if moved {
                    metric_inc(match state {
                        EnvelopeState::Succeeded => "fanout.terminal.succeeded",
                        EnvelopeState::PermanentlyFailed => "fanout.terminal.permanent",
                        _ => "fanout.terminal.abandoned",
                    });
                    emit_event(&self.event_tx, envelope, state, error, attempts).await;
                }
            }
            Disposition::Retry {
                attempt,
                not_before_ms,
            } => {
                let update = TransitionUpdate {
                    attempt: Some(attempt),
                    not_before_ms: Some(not_before_ms),
                    last_error: error,
                    ..TransitionUpdate::default()
                };
                let moved = self
                    .ledger
                    .transition(envelope.id, EnvelopeState::InFlight, EnvelopeState::Pending, &update)
                    .await?;
                if moved {
                    metric_inc("fanout.retry.scheduled");
                }
                // CAS failure means the envelope was cancelled meanwhile;
                // nothing to do.
            }
        }
        Ok(())
    }
}

async fn emit_event(
    event_tx: &mpsc::Sender<DeliveryEvent>,
    envelope: &Envelope,
    state: EnvelopeState,
    last_error: Option<String>,
    attempts: u32,
) {
    let event = DeliveryEvent {
        envelope_id: envelope.id,
        activity_id: envelope.activity_id.clone(),
        inbox: envelope.inbox.clone(),
        state,
        last_error,
        attempts,
    };
    // A dropped receiver means the application stopped listening; the
    // terminal state is still durable in the ledger.
    let _ = event_tx.send(event).await;
}
