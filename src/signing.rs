//! Request signing for outbound deliveries.
//!
//! The cryptography itself is an application capability: the engine only
//! decides *when* signing happens (once per attempt, over the current
//! Date/Digest values) and injects the resulting headers into the POST.
//! Applications hand the engine a [`Signer`]; an HMAC-SHA256
//! implementation is provided for tests and closed federations where both
//! sides share per-actor keys.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::SigningError;
use crate::types::SigningActorId;

/// Everything a signer needs to produce headers for one attempt.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    pub actor: SigningActorId,
    /// Lowercased request method, e.g. `post`.
    pub method: String,
    /// Path-and-query component of the inbox URL.
    pub request_target: String,
    pub host: String,
    /// RFC 7231 Date header value, as sent on the request.
    pub date: String,
    /// Digest header value covering the payload, as sent on the request.
    pub digest: String,
}

/// Produces signature headers for an outbound request.
pub trait Signer: Send + Sync {
    fn sign(&self, req: &SigningRequest) -> Result<Vec<(String, String)>, SigningError>;
}

/// `Digest` header value for a payload: `SHA-256=<base64>`.
pub fn payload_digest(payload: &[u8]) -> String {
    let hash = Sha256::digest(payload);
    format!("SHA-256={}", BASE64.encode(hash))
}

/// RFC 7231 `Date` header value for a unix-millisecond timestamp.
pub fn http_date(now_ms: u64) -> String {
    let datetime = Utc
        .timestamp_millis_opt(now_ms as i64)
        .single()
        .unwrap_or_default();
    datetime.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Extract the path-and-query request target from an inbox URL.
pub fn request_target(url: &str) -> String {
    let stripped = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    match stripped.find('/') {
        Some(index) => stripped[index..].to_string(),
        None => "/".to_string(),
    }
}

/// HMAC-SHA256 signer over the draft-cavage signing string, keyed per
/// actor.
pub struct HmacSigner {
    keys: HashMap<SigningActorId, Vec<u8>>,
}

impl HmacSigner {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    pub fn with_key(mut self, actor: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        self.keys.insert(SigningActorId(actor.into()), key.into());
        self
    }
}

impl Default for HmacSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl Signer for HmacSigner {
    fn sign(&self, req: &SigningRequest) -> Result<Vec<(String, String)>, SigningError> {
        let key = self
            .keys
            .get(&req.actor)
            .ok_or_else(|| SigningError::UnknownActor(req.actor.clone()))?;

        let signing_string = signing_string(req);
        let signature = compute_signature(key, signing_string.as_bytes());

        let header = format!(
            "keyId=\"{}\",algorithm=\"hs2019\",headers=\"(request-target) host date digest\",signature=\"{}\"",
            req.actor.0, signature
        );
        Ok(vec![("Signature".to_string(), header)])
    }
}

/// Canonical signing string over the headers federation peers verify.
fn signing_string(req: &SigningRequest) -> String {
    format!(
        "(request-target): {} {}\nhost: {}\ndate: {}\ndigest: {}",
        req.method, req.request_target, req.host, req.date, req.digest
    )
}

/// Compute the hex-encoded HMAC-SHA256 of `data` under `key`.
pub fn compute_signature(key: &[u8], data: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"default").expect("hmac"));
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex-encoded HMAC-SHA256 signature. For receiving-side tests
/// and closed-federation peers.
pub fn verify_signature(key: &[u8], data: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"default").expect("hmac"));
    mac.update(data);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SigningRequest {
        SigningRequest {
            actor: SigningActorId("https://local.example/actor#main-key".into()),
            method: "post".into(),
            request_target: "/inbox".into(),
            host: "h1.example".into(),
            date: http_date(1_700_000_000_000),
            digest: payload_digest(b"{}"),
        }
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(
            payload_digest(b"{}"),
            "SHA-256=RBNvo1WzZ4oRRq0W9+hknpT7T8If536DEMBg9hyq/4o="
        );
    }

    #[test]
    fn http_date_format() {
        assert_eq!(http_date(0), "Thu, 01 Jan 1970 00:00:00 GMT");
        assert_eq!(http_date(1_700_000_000_000), "Tue, 14 Nov 2023 22:13:20 GMT");
    }

    #[test]
    fn request_target_strips_origin() {
        assert_eq!(request_target("https://h1.example/users/a/inbox"), "/users/a/inbox");
        assert_eq!(request_target("https://h1.example"), "/");
    }

    #[test]
    fn hmac_signer_round_trip() {
        let signer = HmacSigner::new()
            .with_key("https://local.example/actor#main-key", b"secret".to_vec());
        let req = request();
        let headers = signer.sign(&req).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "Signature");

        let value = &headers[0].1;
        let sig_hex = value
            .split("signature=\"")
            .nth(1)
            .and_then(|s| s.strip_suffix('"'))
            .unwrap();
        assert!(verify_signature(
            b"secret",
            signing_string(&req).as_bytes(),
            sig_hex
        ));
    }

    #[test]
    fn unknown_actor_is_an_error() {
        let signer = HmacSigner::new();
        let err = signer.sign(&request()).unwrap_err();
        assert!(matches!(err, SigningError::UnknownActor(_)));
    }
}
