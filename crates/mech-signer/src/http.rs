// SPDX-License-Identifier: MIT OR Apache-2.0
//! RFC-9421 HTTP message signatures.
//!
//! The worker signs broker requests with a request-bound, non-replayable
//! signature over `@method` and `@target-uri`, valid for 60 seconds. The
//! verifier half lives here too so both sides share one signature base.

use crate::{OperatorSigner, SignerError, eip191_hash, signature_bytes, signature_from_bytes};
use alloy_primitives::Address;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Signature lifetime.
pub const SIGNATURE_TTL: Duration = Duration::from_secs(60);
/// Clock skew tolerated by the verifier on either side of a timestamp.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(10);

const LABEL: &str = "sig1";
const ALG: &str = "ecdsa-secp256k1-keccak";

/// The two headers produced by [`sign_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    /// `Signature-Input` header value.
    pub signature_input: String,
    /// `Signature` header value.
    pub signature: String,
}

/// Errors from signing or verifying HTTP signatures.
#[derive(Debug, thiserror::Error)]
pub enum HttpSignatureError {
    /// The underlying key operation failed.
    #[error(transparent)]
    Signer(#[from] SignerError),
    /// A header was missing or structurally invalid.
    #[error("malformed signature header: {0}")]
    Malformed(String),
    /// The signature window has expired or is not yet valid.
    #[error("signature outside validity window")]
    Expired,
    /// The nonce was seen before.
    #[error("replayed nonce")]
    Replayed,
    /// Recovered signer does not match the declared key id.
    #[error("signature does not match key id {0}")]
    KeyMismatch(String),
}

/// Replay protection: `consume` returns `false` when the nonce was already
/// used within its ttl.
pub trait NonceConsumer: Send + Sync {
    /// Record the nonce; `true` when it was fresh.
    fn consume(&self, nonce: &str, ttl: Duration) -> bool;
}

/// In-memory nonce cache for a single verifier process.
#[derive(Debug, Default)]
pub struct MemoryNonceCache {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl NonceConsumer for MemoryNonceCache {
    fn consume(&self, nonce: &str, ttl: Duration) -> bool {
        let now = Utc::now();
        let horizon = chrono::Duration::from_std(ttl + MAX_CLOCK_SKEW)
            .unwrap_or_else(|_| chrono::Duration::seconds(70));
        let mut seen = self.seen.lock().expect("nonce lock poisoned");
        seen.retain(|_, stamped| now - *stamped < horizon);
        if seen.contains_key(nonce) {
            return false;
        }
        seen.insert(nonce.to_string(), now);
        true
    }
}

fn signature_base(method: &str, target_uri: &str, params: &str) -> String {
    format!(
        "\"@method\": {}\n\"@target-uri\": {}\n\"@signature-params\": {}",
        method.to_uppercase(),
        target_uri,
        params
    )
}

fn signature_params(created: i64, expires: i64, nonce: &str, key_id: &str) -> String {
    format!(
        "(\"@method\" \"@target-uri\");created={created};expires={expires};nonce=\"{nonce}\";keyid=\"{key_id}\";alg=\"{ALG}\""
    )
}

/// Sign an outgoing request, producing `Signature-Input` and `Signature`
/// header values.
pub fn sign_request(
    signer: &OperatorSigner,
    method: &str,
    target_uri: &str,
    nonce: &str,
    now: DateTime<Utc>,
) -> Result<SignatureHeaders, HttpSignatureError> {
    let created = now.timestamp();
    let expires = created + SIGNATURE_TTL.as_secs() as i64;
    let params = signature_params(created, expires, nonce, &signer.key_id());
    let base = signature_base(method, target_uri, &params);

    let digest = eip191_hash(base.as_bytes());
    let sig = signer.sign_hash(&digest)?;
    let encoded = BASE64.encode(signature_bytes(&sig, 0));

    Ok(SignatureHeaders {
        signature_input: format!("{LABEL}={params}"),
        signature: format!("{LABEL}=:{encoded}:"),
    })
}

/// Parsed fields of a `Signature-Input` header.
#[derive(Debug, Clone)]
struct ParsedInput {
    params: String,
    created: i64,
    expires: i64,
    nonce: String,
    key_id: String,
}

fn parse_input(header: &str) -> Result<ParsedInput, HttpSignatureError> {
    let params = header
        .strip_prefix(&format!("{LABEL}="))
        .ok_or_else(|| HttpSignatureError::Malformed("unknown label".to_string()))?
        .to_string();

    let field = |name: &str| -> Result<String, HttpSignatureError> {
        let marker = format!("{name}=");
        let start = params
            .find(&marker)
            .ok_or_else(|| HttpSignatureError::Malformed(format!("missing {name}")))?
            + marker.len();
        let rest = &params[start..];
        let value = if let Some(stripped) = rest.strip_prefix('"') {
            stripped
                .split('"')
                .next()
                .unwrap_or_default()
                .to_string()
        } else {
            rest.split(';').next().unwrap_or_default().to_string()
        };
        Ok(value)
    };

    let created = field("created")?
        .parse()
        .map_err(|_| HttpSignatureError::Malformed("created not an integer".to_string()))?;
    let expires = field("expires")?
        .parse()
        .map_err(|_| HttpSignatureError::Malformed("expires not an integer".to_string()))?;

    Ok(ParsedInput {
        params: params.clone(),
        created,
        expires,
        nonce: field("nonce")?,
        key_id: field("keyid")?,
    })
}

/// Verify an incoming request's signature headers.
///
/// Checks the validity window (with ±10 s skew), consumes the nonce, and
/// recovers the signer address against the declared key id.
pub fn verify_request(
    headers: &SignatureHeaders,
    method: &str,
    target_uri: &str,
    nonces: &dyn NonceConsumer,
    now: DateTime<Utc>,
) -> Result<Address, HttpSignatureError> {
    let input = parse_input(&headers.signature_input)?;

    let skew = MAX_CLOCK_SKEW.as_secs() as i64;
    let ts = now.timestamp();
    if ts + skew < input.created || ts - skew > input.expires {
        return Err(HttpSignatureError::Expired);
    }

    if !nonces.consume(&input.nonce, SIGNATURE_TTL) {
        return Err(HttpSignatureError::Replayed);
    }

    let encoded = headers
        .signature
        .strip_prefix(&format!("{LABEL}=:"))
        .and_then(|s| s.strip_suffix(':'))
        .ok_or_else(|| HttpSignatureError::Malformed("signature framing".to_string()))?;
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| HttpSignatureError::Malformed(e.to_string()))?;
    let raw: [u8; 65] = raw
        .try_into()
        .map_err(|_| HttpSignatureError::Malformed("signature length".to_string()))?;
    let sig = signature_from_bytes(&raw)?;

    let base = signature_base(method, target_uri, &input.params);
    let recovered = sig
        .recover_address_from_prehash(&eip191_hash(base.as_bytes()))
        .map_err(|e| HttpSignatureError::Malformed(e.to_string()))?;

    let declared: Address = input
        .key_id
        .split(':')
        .nth(1)
        .unwrap_or_default()
        .parse()
        .map_err(|_| HttpSignatureError::Malformed("keyid address".to_string()))?;
    if recovered != declared {
        return Err(HttpSignatureError::KeyMismatch(input.key_id));
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe512961708279feb1be6ae5538da033";
    const URI: &str = "https://broker.example/credentials/capabilities";

    fn signer() -> OperatorSigner {
        OperatorSigner::from_hex(KEY, 100).unwrap()
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let s = signer();
        let now = Utc::now();
        let headers = sign_request(&s, "POST", URI, "nonce-1", now).unwrap();
        let cache = MemoryNonceCache::default();
        let recovered = verify_request(&headers, "POST", URI, &cache, now).unwrap();
        assert_eq!(recovered, s.address());
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let s = signer();
        let now = Utc::now();
        let headers = sign_request(&s, "POST", URI, "nonce-2", now).unwrap();
        let cache = MemoryNonceCache::default();
        verify_request(&headers, "POST", URI, &cache, now).unwrap();
        let err = verify_request(&headers, "POST", URI, &cache, now).unwrap_err();
        assert!(matches!(err, HttpSignatureError::Replayed));
    }

    #[test]
    fn expired_signature_is_rejected() {
        let s = signer();
        let created = Utc::now();
        let headers = sign_request(&s, "POST", URI, "nonce-3", created).unwrap();
        let cache = MemoryNonceCache::default();
        let later = created + chrono::Duration::seconds(75);
        let err = verify_request(&headers, "POST", URI, &cache, later).unwrap_err();
        assert!(matches!(err, HttpSignatureError::Expired));
    }

    #[test]
    fn skew_inside_ten_seconds_is_tolerated() {
        let s = signer();
        let created = Utc::now();
        let headers = sign_request(&s, "POST", URI, "nonce-4", created).unwrap();
        let cache = MemoryNonceCache::default();
        // Verifier clock 8 seconds behind the signer.
        let behind = created - chrono::Duration::seconds(8);
        verify_request(&headers, "POST", URI, &cache, behind).unwrap();
    }

    #[test]
    fn tampered_target_fails_key_check() {
        let s = signer();
        let now = Utc::now();
        let headers = sign_request(&s, "POST", URI, "nonce-5", now).unwrap();
        let cache = MemoryNonceCache::default();
        let err =
            verify_request(&headers, "POST", "https://evil.example/", &cache, now).unwrap_err();
        assert!(matches!(err, HttpSignatureError::KeyMismatch(_)));
    }

    #[test]
    fn key_id_binds_chain_and_address() {
        let headers = sign_request(&signer(), "GET", URI, "nonce-6", Utc::now()).unwrap();
        assert!(headers.signature_input.contains("keyid=\"100:0x"));
        assert!(headers.signature_input.contains("nonce=\"nonce-6\""));
    }

    #[test]
    fn nonce_cache_prunes_old_entries() {
        let cache = MemoryNonceCache::default();
        assert!(cache.consume("a", Duration::from_secs(60)));
        assert!(!cache.consume("a", Duration::from_secs(60)));
        assert!(cache.consume("b", Duration::from_secs(60)));
    }
}
