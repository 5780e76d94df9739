// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-gater
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Peer admission for the content overlay: a peer is allowed through the
//! encrypted connection gates only when its identity key derives to a
//! currently-staked operator address, or its peer id is explicitly trusted.
//! Dial, multiaddr, and upgrade gates always allow; admission is decided
//! exactly where the remote's identity is proven.

use alloy_primitives::{Address, keccak256};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use libp2p_identity::{PeerId, PublicKey};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How long a fetched staking set stays fresh.
pub const STAKING_CACHE_TTL: Duration = Duration::from_secs(300);

/// The connection gates libp2p consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionGate {
    /// Outbound dial attempt; always allowed.
    Dial,
    /// Multiaddr filtering; always allowed.
    Multiaddr,
    /// Transport upgrade; always allowed.
    Upgrade,
    /// Inbound connection after encryption; admission applies.
    InboundEncrypted,
    /// Outbound connection after encryption; admission applies.
    OutboundEncrypted,
}

impl ConnectionGate {
    /// `true` for the gates where the remote identity is proven.
    #[must_use]
    pub fn enforces_admission(&self) -> bool {
        matches!(self, Self::InboundEncrypted | Self::OutboundEncrypted)
    }
}

/// Why a peer was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The peer key is not secp256k1, so no operator address derives.
    NotSecp256k1,
    /// The derived address is not in the staked set.
    NotStaked(Address),
}

/// The gater's verdict for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Let the connection through.
    Allow,
    /// Close the connection.
    Deny(DenyReason),
}

/// Source of the currently-staked operator set.
#[async_trait::async_trait]
pub trait StakedSetSource: Send + Sync {
    /// Fetch the set of operator addresses with an active stake.
    async fn staked_operators(&self) -> Result<HashSet<Address>, StakedSetError>;
}

/// Staking set fetch failure.
#[derive(Debug, thiserror::Error)]
#[error("staking set fetch failed: {0}")]
pub struct StakedSetError(pub String);

/// Derive the operator address from a peer's public identity key.
///
/// Standard chain derivation: keccak-256 over the uncompressed public key
/// body (64 bytes, SEC1 point without the `0x04` tag), last 20 bytes.
/// Non-secp256k1 keys derive nothing.
#[must_use]
pub fn derive_operator_address(key: &PublicKey) -> Option<Address> {
    let compressed = key.clone().try_into_secp256k1().ok()?.to_bytes();
    let point = k256::PublicKey::from_sec1_bytes(&compressed).ok()?;
    let uncompressed = point.to_encoded_point(false);
    let body = &uncompressed.as_bytes()[1..];
    let digest = keccak256(body);
    Some(Address::from_slice(&digest[12..]))
}

struct CachedSet {
    operators: HashSet<Address>,
    fetched_at: Instant,
}

/// Staking-gated admission with a fail-static cache.
///
/// The staked set is cached for [`STAKING_CACHE_TTL`]. A failed refresh
/// serves the previous value; a failed first fetch fails open so a cold
/// boot cannot lock the worker out of the overlay, with the failure counted
/// for the health surface.
pub struct AdmissionGater<S> {
    source: S,
    trusted: HashSet<String>,
    cache: Mutex<Option<CachedSet>>,
    ttl: Duration,
    cold_start_failures: AtomicU64,
}

impl<S: StakedSetSource> AdmissionGater<S> {
    /// Build a gater over the staking source with an explicit trusted set.
    pub fn new(source: S, trusted_peers: impl IntoIterator<Item = String>) -> Self {
        Self {
            source,
            trusted: trusted_peers.into_iter().collect(),
            cache: Mutex::new(None),
            ttl: STAKING_CACHE_TTL,
            cold_start_failures: AtomicU64::new(0),
        }
    }

    /// Override the cache ttl (tests).
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Cold-start refresh failures observed so far.
    #[must_use]
    pub fn cold_start_failures(&self) -> u64 {
        self.cold_start_failures.load(Ordering::Relaxed)
    }

    /// The staked set, refreshed when stale. `None` means unknown
    /// (first fetch failed): callers fail open.
    async fn staked_set(&self) -> Option<HashSet<Address>> {
        let mut cache = self.cache.lock().await;
        let stale = cache
            .as_ref()
            .map(|c| c.fetched_at.elapsed() >= self.ttl)
            .unwrap_or(true);
        if stale {
            match self.source.staked_operators().await {
                Ok(operators) => {
                    *cache = Some(CachedSet {
                        operators,
                        fetched_at: Instant::now(),
                    });
                }
                Err(err) if cache.is_some() => {
                    // Fail-static: keep serving the previous set.
                    warn!(target: "mech.gater", error = %err, "staking refresh failed; serving cached set");
                }
                Err(err) => {
                    self.cold_start_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(target: "mech.gater", error = %err, "staking fetch failed on cold start; failing open");
                }
            }
        }
        cache.as_ref().map(|c| c.operators.clone())
    }

    /// `true` when `address` is in the staked set, or the set is unknown
    /// (cold-start fail-open). Shared with the claim loop's stake gate.
    pub async fn is_staked(&self, address: Address) -> bool {
        match self.staked_set().await {
            Some(staked) => staked.contains(&address),
            None => true,
        }
    }

    /// Decide admission for one connection.
    pub async fn admit(
        &self,
        gate: ConnectionGate,
        peer_id: &PeerId,
        key: &PublicKey,
    ) -> Admission {
        if !gate.enforces_admission() {
            return Admission::Allow;
        }
        if self.trusted.contains(&peer_id.to_string()) {
            debug!(target: "mech.gater", %peer_id, "trusted peer admitted");
            return Admission::Allow;
        }
        let Some(address) = derive_operator_address(key) else {
            return Admission::Deny(DenyReason::NotSecp256k1);
        };
        match self.staked_set().await {
            Some(staked) if staked.contains(&address) => Admission::Allow,
            Some(_) => Admission::Deny(DenyReason::NotStaked(address)),
            // Unknown set on cold start: fail open.
            None => Admission::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn secp_identity() -> (PeerId, PublicKey) {
        let keypair = libp2p_identity::Keypair::generate_secp256k1();
        (keypair.public().to_peer_id(), keypair.public())
    }

    fn ed_identity() -> (PeerId, PublicKey) {
        let keypair = libp2p_identity::Keypair::generate_ed25519();
        (keypair.public().to_peer_id(), keypair.public())
    }

    struct FixedSource {
        staked: HashSet<Address>,
        fail: AtomicBool,
        calls: AtomicU64,
    }

    impl FixedSource {
        fn staking(addresses: impl IntoIterator<Item = Address>) -> Self {
            Self {
                staked: addresses.into_iter().collect(),
                fail: AtomicBool::new(false),
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl StakedSetSource for &FixedSource {
        async fn staked_operators(&self) -> Result<HashSet<Address>, StakedSetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StakedSetError("rpc down".into()));
            }
            Ok(self.staked.clone())
        }
    }

    #[test]
    fn derivation_needs_secp256k1() {
        let (_, secp_key) = secp_identity();
        assert!(derive_operator_address(&secp_key).is_some());
        let (_, ed_key) = ed_identity();
        assert!(derive_operator_address(&ed_key).is_none());
    }

    #[test]
    fn derivation_is_deterministic() {
        let (_, key) = secp_identity();
        assert_eq!(derive_operator_address(&key), derive_operator_address(&key));
    }

    #[tokio::test]
    async fn staked_peer_is_admitted_unstaked_denied() {
        let (peer, key) = secp_identity();
        let address = derive_operator_address(&key).unwrap();
        let source = FixedSource::staking([address]);
        let gater = AdmissionGater::new(&source, []);

        assert_eq!(
            gater.admit(ConnectionGate::InboundEncrypted, &peer, &key).await,
            Admission::Allow
        );

        let (other_peer, other_key) = secp_identity();
        let verdict = gater
            .admit(ConnectionGate::OutboundEncrypted, &other_peer, &other_key)
            .await;
        assert!(matches!(verdict, Admission::Deny(DenyReason::NotStaked(_))));
    }

    #[tokio::test]
    async fn trusted_peer_bypasses_staking() {
        let (peer, key) = secp_identity();
        let source = FixedSource::staking([]);
        let gater = AdmissionGater::new(&source, [peer.to_string()]);
        assert_eq!(
            gater.admit(ConnectionGate::InboundEncrypted, &peer, &key).await,
            Admission::Allow
        );
    }

    #[tokio::test]
    async fn non_admission_gates_always_allow() {
        let (peer, key) = ed_identity();
        let source = FixedSource::staking([]);
        let gater = AdmissionGater::new(&source, []);
        for gate in [ConnectionGate::Dial, ConnectionGate::Multiaddr, ConnectionGate::Upgrade] {
            assert_eq!(gater.admit(gate, &peer, &key).await, Admission::Allow);
        }
    }

    #[tokio::test]
    async fn non_secp_peer_is_denied_at_encrypted_gate() {
        let (peer, key) = ed_identity();
        let source = FixedSource::staking([]);
        let gater = AdmissionGater::new(&source, []);
        assert_eq!(
            gater.admit(ConnectionGate::InboundEncrypted, &peer, &key).await,
            Admission::Deny(DenyReason::NotSecp256k1)
        );
    }

    #[tokio::test]
    async fn refresh_failure_serves_previous_set() {
        let (peer, key) = secp_identity();
        let address = derive_operator_address(&key).unwrap();
        let source = FixedSource::staking([address]);
        let gater = AdmissionGater::new(&source, []).with_ttl(Duration::ZERO);

        assert_eq!(
            gater.admit(ConnectionGate::InboundEncrypted, &peer, &key).await,
            Admission::Allow
        );
        source.fail.store(true, Ordering::SeqCst);
        // Stale + failing refresh: previous set still admits.
        assert_eq!(
            gater.admit(ConnectionGate::InboundEncrypted, &peer, &key).await,
            Admission::Allow
        );
        assert_eq!(gater.cold_start_failures(), 0);
    }

    #[tokio::test]
    async fn cold_start_failure_fails_open_and_is_counted() {
        let (peer, key) = secp_identity();
        let source = FixedSource::staking([]);
        source.fail.store(true, Ordering::SeqCst);
        let gater = AdmissionGater::new(&source, []);

        assert_eq!(
            gater.admit(ConnectionGate::InboundEncrypted, &peer, &key).await,
            Admission::Allow
        );
        assert_eq!(gater.cold_start_failures(), 1);
    }

    #[tokio::test]
    async fn fresh_cache_is_not_refetched() {
        let (peer, key) = secp_identity();
        let address = derive_operator_address(&key).unwrap();
        let source = FixedSource::staking([address]);
        let gater = AdmissionGater::new(&source, []);

        gater.admit(ConnectionGate::InboundEncrypted, &peer, &key).await;
        gater.admit(ConnectionGate::InboundEncrypted, &peer, &key).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
