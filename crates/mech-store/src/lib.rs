// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-store
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The content store client: `put_json` into a local blockstore with a
//! pubsub announce, `get` resolving local → peers → HTTP gateway, and
//! `get_legacy` reconciling historic content stored under heterogeneous
//! codecs.
//!
//! Absence is not an error: every read path returns `Ok(None)` once all
//! candidates are exhausted, and callers decide whether that is fatal.

/// Directory-backed local blockstore.
pub mod blockstore;
/// HTTP gateway fallback with backoff.
pub mod gateway;
/// Legacy CID candidate enumeration.
pub mod legacy;

use async_trait::async_trait;
use blockstore::Blockstore;
use cid::Cid;
use gateway::Gateway;
use mech_core::RequestId;
use multihash_codetable::{Code, MultihashDigest};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Multicodec for raw blocks.
pub const RAW_CODEC: u64 = 0x55;
/// Multicodec for dag-pb blocks (legacy directory wrapping).
pub const DAG_PB_CODEC: u64 = 0x70;

/// Errors from store operations.
///
/// "Not found" is deliberately not represented here; reads return
/// `Ok(None)` instead.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Blockstore I/O failed.
    #[error("blockstore io: {0}")]
    Io(#[from] std::io::Error),
    /// Payload serialization failed.
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    /// The digest hex was not 32 bytes.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
    /// Gateway transport failed after retries.
    #[error(transparent)]
    Gateway(#[from] gateway::GatewayError),
}

/// Announce a freshly stored block to the overlay.
///
/// The production announcer publishes on the pubsub topic; tests and
/// gateway-only deployments use [`NoopAnnouncer`].
pub trait Announce: Send + Sync {
    /// Called after a successful local `put`.
    fn announce(&self, cid: &Cid);
}

/// Announcer that only logs.
#[derive(Debug, Default)]
pub struct NoopAnnouncer;

impl Announce for NoopAnnouncer {
    fn announce(&self, cid: &Cid) {
        debug!(target: "mech.store", %cid, "announce skipped (no overlay)");
    }
}

/// Fetch a block from admitted peers on the overlay.
#[async_trait]
pub trait PeerFetch: Send + Sync {
    /// Returns the block bytes, or `None` when no admitted peer has it.
    async fn fetch(&self, cid: &Cid) -> Option<Vec<u8>>;
}

/// The content store client.
pub struct ContentStore {
    blockstore: Blockstore,
    gateway: Option<Gateway>,
    announcer: Arc<dyn Announce>,
    peers: Option<Arc<dyn PeerFetch>>,
}

impl ContentStore {
    /// Build a store over the given blockstore directory.
    pub fn new(blockstore: Blockstore, gateway: Option<Gateway>) -> Self {
        Self {
            blockstore,
            gateway,
            announcer: Arc::new(NoopAnnouncer),
            peers: None,
        }
    }

    /// Attach an overlay announcer.
    #[must_use]
    pub fn with_announcer(mut self, announcer: Arc<dyn Announce>) -> Self {
        self.announcer = announcer;
        self
    }

    /// Attach a peer fetcher.
    #[must_use]
    pub fn with_peers(mut self, peers: Arc<dyn PeerFetch>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Encode `value` as JSON, store it, announce it, and return the
    /// canonical CID plus the `0x`-prefixed 32-byte digest hex used for
    /// on-chain storage.
    pub async fn put_json<T: Serialize>(&self, value: &T) -> Result<(Cid, String), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        let hash = Code::Sha2_256.digest(&bytes);
        let cid = Cid::new_v1(RAW_CODEC, hash);
        self.blockstore.put(&cid, &bytes).await?;
        self.announcer.announce(&cid);
        let digest_hex = format!("0x{}", hex::encode(hash.digest()));
        Ok((cid, digest_hex))
    }

    /// Resolve a CID: local blockstore, then admitted peers, then the HTTP
    /// gateway with backoff. `Ok(None)` when nobody has it.
    pub async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(bytes) = self.blockstore.get(cid).await? {
            return Ok(Some(bytes));
        }
        if let Some(peers) = &self.peers {
            if let Some(bytes) = peers.fetch(cid).await {
                // Cache the block so the next read is local.
                self.blockstore.put(cid, &bytes).await?;
                return Ok(Some(bytes));
            }
        }
        if let Some(gateway) = &self.gateway {
            return Ok(gateway.fetch(&cid.to_string()).await?);
        }
        Ok(None)
    }

    /// Resolve and decode JSON in one step.
    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        cid: &Cid,
    ) -> Result<Option<T>, StoreError> {
        match self.get(cid).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Resolve content known only by its on-chain 32-byte digest: try the
    /// canonical raw CID through the normal path, then fall back to the
    /// legacy candidates.
    pub async fn get_by_digest(
        &self,
        digest_hex: &str,
        request_id: Option<&RequestId>,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let digest = legacy::parse_digest(digest_hex)?;
        let cid = Cid::new_v1(
            RAW_CODEC,
            cid::multihash::Multihash::wrap(0x12, &digest).expect("32-byte digest fits"),
        );
        if let Some(bytes) = self.get(&cid).await? {
            return Ok(Some(bytes));
        }
        self.get_legacy(digest_hex, request_id).await
    }

    /// Resolve historic content stored under heterogeneous codecs.
    ///
    /// Candidates are enumerated per [`legacy::candidates`]; the first
    /// gateway success wins. Exhaustion returns `Ok(None)`.
    pub async fn get_legacy(
        &self,
        digest_hex: &str,
        request_id: Option<&RequestId>,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(gateway) = &self.gateway else {
            warn!(target: "mech.store", "legacy resolution needs a gateway");
            return Ok(None);
        };
        for candidate in legacy::candidates(digest_hex, request_id)? {
            match gateway.fetch(&candidate).await {
                Ok(Some(bytes)) => {
                    debug!(target: "mech.store", %candidate, "legacy candidate hit");
                    return Ok(Some(bytes));
                }
                Ok(None) => continue,
                Err(err) => {
                    warn!(target: "mech.store", %candidate, error = %err, "legacy candidate errored");
                    continue;
                }
            }
        }
        Ok(None)
    }
}
