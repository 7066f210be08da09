use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable, content-addressable identifier of an activity.
///
/// The activity itself (an already-serialized federated event) is owned by
/// the application; the engine only carries the id and the opaque payload.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of activity ids with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityId(pub String);

/// Opaque reference to a local or remote account, as the application's
/// actor directory knows it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef(pub String);

/// Which local identity's key signs outbound requests for an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SigningActorId(pub String);

/// Unique identifier of one unit of delivery work.
///
/// UUIDv7, so ids sort roughly by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvelopeId(pub Uuid);

impl EnvelopeId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

/// Audience class of an activity.
///
/// Only the inbox resolver consults this: limited-audience activities must
/// be delivered to each recipient's personal inbox rather than batched
/// through a shared inbox. Everything downstream of the resolver is
/// activity-class-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityClass {
    Public,
    Unlisted,
    FollowersOnly,
    /// Addressed to an explicit, limited audience.
    Limited,
    /// Direct message to specific accounts.
    Direct,
}

impl ActivityClass {
    /// Whether deliveries of this class may be coalesced into a host's
    /// shared inbox.
    pub fn allows_shared_inbox(self) -> bool {
        !matches!(self, ActivityClass::Limited | ActivityClass::Direct)
    }
}

/// A federated activity to be delivered.
///
/// The engine treats the payload as opaque bytes. Construction,
/// validation, and schema of the activity JSON are the application's
/// responsibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub payload: Vec<u8>,
}

impl Activity {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: ActivityId(id.into()),
            payload: payload.into(),
        }
    }
}

/// One row of the application's actor directory, handed to the resolver.
///
/// The resolver never performs network lookups; inbox URLs arrive
/// pre-discovered from the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub account: AccountRef,
    /// The account's personal inbox URL, when known.
    pub inbox_url: Option<String>,
    /// A host-wide shared inbox URL, when the remote server advertises one.
    pub shared_inbox_url: Option<String>,
}

impl Recipient {
    pub fn new(account: impl Into<String>, inbox_url: impl Into<String>) -> Self {
        Self {
            account: AccountRef(account.into()),
            inbox_url: Some(inbox_url.into()),
            shared_inbox_url: None,
        }
    }

    pub fn with_shared_inbox(mut self, url: impl Into<String>) -> Self {
        self.shared_inbox_url = Some(url.into());
        self
    }
}

/// A resolved remote delivery endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteInbox {
    /// Host component of the URL; grouping key for concurrency caps and
    /// circuit breaking.
    pub host: String,
    /// Full inbox URL.
    pub url: String,
    /// Whether this URL serves multiple recipient accounts on the host.
    pub shared: bool,
}

impl RemoteInbox {
    /// Build an inbox from a URL, deriving the host component.
    ///
    /// Returns `None` for URLs with no parseable host.
    pub fn from_url(url: impl Into<String>, shared: bool) -> Option<Self> {
        let url = url.into();
        let host = host_of(&url)?;
        Some(Self { host, url, shared })
    }
}

/// Extract the host from an http(s) URL, stripping userinfo and port.
fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// Lifecycle state of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeState {
    /// Waiting for dispatch; eligible once `not_before` has passed.
    Pending,
    /// Claimed by a worker under a lease.
    InFlight,
    /// Remote inbox accepted the delivery.
    Succeeded,
    /// Remote rejected the delivery with a non-retryable error.
    PermanentlyFailed,
    /// Retries exhausted, or delivery cancelled by the application.
    Abandoned,
}

impl EnvelopeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EnvelopeState::Succeeded | EnvelopeState::PermanentlyFailed | EnvelopeState::Abandoned
        )
    }
}

/// The unit of delivery work: one activity to one inbox.
///
/// Exactly one envelope exists per `(activity_id, inbox.url)` pair; the
/// ledger enforces this on insert. Envelopes are created Pending and only
/// ever mutated through the ledger's compare-and-swap transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub activity_id: ActivityId,
    pub inbox: RemoteInbox,
    pub signing_actor: SigningActorId,
    pub state: EnvelopeState,
    /// Number of completed attempts.
    pub attempt: u32,
    /// Not eligible for claim before this time (unix millis).
    pub not_before_ms: u64,
    /// Lease expiry while InFlight (unix millis).
    pub lease_expires_ms: Option<u64>,
    pub last_error: Option<String>,
    pub created_at_ms: u64,
}

impl Envelope {
    /// Build a fresh Pending envelope for one inbox.
    pub fn build(
        activity_id: ActivityId,
        inbox: RemoteInbox,
        signing_actor: SigningActorId,
        now_ms: u64,
    ) -> Self {
        Self {
            id: EnvelopeId::generate(),
            activity_id,
            inbox,
            signing_actor,
            state: EnvelopeState::Pending,
            attempt: 0,
            not_before_ms: now_ms,
            lease_expires_ms: None,
            last_error: None,
            created_at_ms: now_ms,
        }
    }
}

/// An envelope claimed for delivery, together with the activity payload.
#[derive(Debug, Clone)]
pub struct ClaimedEnvelope {
    pub envelope: Envelope,
    pub payload: Vec<u8>,
}

/// Terminal-outcome record emitted to the application for every envelope
/// reaching Succeeded, PermanentlyFailed, or Abandoned. Emitted exactly
/// once per envelope.
#[derive(Debug, Clone)]
pub struct DeliveryEvent {
    pub envelope_id: EnvelopeId,
    pub activity_id: ActivityId,
    pub inbox: RemoteInbox,
    pub state: EnvelopeState,
    pub last_error: Option<String>,
    pub attempts: u32,
}

/// Current unix time in milliseconds.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(
            RemoteInbox::from_url("https://mastodon.example/inbox", true).map(|i| i.host),
            Some("mastodon.example".to_string())
        );
        assert_eq!(
            RemoteInbox::from_url("http://h2:8080/users/alice/inbox", false).map(|i| i.host),
            Some("h2".to_string())
        );
        assert!(RemoteInbox::from_url("not-a-url", false).is_none());
        assert!(RemoteInbox::from_url("https:///inbox", false).is_none());
    }

    #[test]
    fn shared_inbox_eligibility() {
        assert!(ActivityClass::Public.allows_shared_inbox());
        assert!(ActivityClass::FollowersOnly.allows_shared_inbox());
        assert!(!ActivityClass::Limited.allows_shared_inbox());
        assert!(!ActivityClass::Direct.allows_shared_inbox());
    }

    #[test]
    fn terminal_states() {
        assert!(!EnvelopeState::Pending.is_terminal());
        assert!(!EnvelopeState::InFlight.is_terminal());
        assert!(EnvelopeState::Succeeded.is_terminal());
        assert!(EnvelopeState::PermanentlyFailed.is_terminal());
        assert!(EnvelopeState::Abandoned.is_terminal());
    }
}
