//! Inbox resolution: recipient accounts to distinct delivery endpoints.
//!
//! Given the application-supplied actor-directory rows for an activity's
//! recipients, compute the minimal set of inbox URLs to POST to. Accounts
//! on the same host that share a shared inbox collapse to one delivery,
//! except for limited-audience activity classes which must address each
//! personal inbox. Pure; no network, no side effects.

use std::collections::HashSet;

use crate::types::{AccountRef, ActivityClass, Recipient, RemoteInbox};

/// Result of resolving a recipient set.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Distinct delivery endpoints, deduplicated by URL.
    pub inboxes: Vec<RemoteInbox>,
    /// Recipients with no usable inbox URL. Dropped from the batch and
    /// reported to the caller; they never fail the batch.
    pub dropped: Vec<AccountRef>,
}

/// Resolve a recipient set to distinct remote inboxes.
pub fn resolve(class: ActivityClass, recipients: &[Recipient]) -> Resolution {
    let mut seen: HashSet<String> = HashSet::new();
    let mut resolution = Resolution::default();

    for recipient in recipients {
        let chosen = preferred_inbox(class, recipient);

        let Some(inbox) = chosen else {
            resolution.dropped.push(recipient.account.clone());
            continue;
        };

        if seen.insert(inbox.url.clone()) {
            resolution.inboxes.push(inbox);
        }
    }

    resolution
}

/// Pick one inbox for a recipient: the shared inbox when present and the
/// activity class permits batching, else the personal inbox.
fn preferred_inbox(class: ActivityClass, recipient: &Recipient) -> Option<RemoteInbox> {
    if class.allows_shared_inbox() {
        if let Some(url) = non_empty(recipient.shared_inbox_url.as_deref()) {
            if let Some(inbox) = RemoteInbox::from_url(url, true) {
                return Some(inbox);
            }
        }
    }

    let url = non_empty(recipient.inbox_url.as_deref())?;
    RemoteInbox::from_url(url, false)
}

fn non_empty(url: Option<&str>) -> Option<&str> {
    match url {
        Some(u) if !u.trim().is_empty() => Some(u),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_recipient(account: &str) -> Recipient {
        Recipient::new(account, format!("https://h1.example/users/{account}/inbox"))
            .with_shared_inbox("https://h1.example/inbox")
    }

    #[test]
    fn groups_by_shared_inbox() {
        let recipients = vec![
            shared_recipient("alice"),
            shared_recipient("bob"),
            shared_recipient("carol"),
            Recipient::new("dave", "https://h2.example/users/dave/inbox"),
        ];

        let resolution = resolve(ActivityClass::Public, &recipients);
        assert!(resolution.dropped.is_empty());
        assert_eq!(resolution.inboxes.len(), 2);
        assert_eq!(resolution.inboxes[0].url, "https://h1.example/inbox");
        assert!(resolution.inboxes[0].shared);
        assert_eq!(resolution.inboxes[1].url, "https://h2.example/users/dave/inbox");
        assert!(!resolution.inboxes[1].shared);
    }

    #[test]
    fn limited_audience_bypasses_shared_inbox() {
        let recipients = vec![shared_recipient("alice"), shared_recipient("bob")];

        let resolution = resolve(ActivityClass::Limited, &recipients);
        assert_eq!(resolution.inboxes.len(), 2);
        assert!(resolution.inboxes.iter().all(|i| !i.shared));
        assert!(resolution
            .inboxes
            .iter()
            .any(|i| i.url == "https://h1.example/users/alice/inbox"));
    }

    #[test]
    fn direct_bypasses_shared_inbox() {
        let resolution = resolve(ActivityClass::Direct, &[shared_recipient("alice")]);
        assert_eq!(resolution.inboxes.len(), 1);
        assert!(!resolution.inboxes[0].shared);
    }

    #[test]
    fn dedup_by_url() {
        let recipients = vec![
            Recipient::new("alice", "https://h2.example/shared"),
            Recipient::new("bob", "https://h2.example/shared"),
        ];
        let resolution = resolve(ActivityClass::Public, &recipients);
        assert_eq!(resolution.inboxes.len(), 1);
    }

    #[test]
    fn unresolvable_recipient_is_dropped_not_fatal() {
        let recipients = vec![
            Recipient {
                account: AccountRef("ghost".into()),
                inbox_url: None,
                shared_inbox_url: None,
            },
            Recipient {
                account: AccountRef("blank".into()),
                inbox_url: Some("  ".into()),
                shared_inbox_url: None,
            },
            Recipient::new("alice", "https://h1.example/users/alice/inbox"),
        ];

        let resolution = resolve(ActivityClass::Public, &recipients);
        assert_eq!(resolution.inboxes.len(), 1);
        assert_eq!(
            resolution.dropped,
            vec![AccountRef("ghost".into()), AccountRef("blank".into())]
        );
    }

    #[test]
    fn shared_inbox_with_bad_url_falls_back_to_personal() {
        let recipient = Recipient::new("alice", "https://h1.example/users/alice/inbox")
            .with_shared_inbox("garbage");
        let resolution = resolve(ActivityClass::Public, &[recipient]);
        assert_eq!(resolution.inboxes.len(), 1);
        assert!(!resolution.inboxes[0].shared);
    }
}
