// SPDX-License-Identifier: MIT OR Apache-2.0
//! Marketplace dispatch.
//!
//! Publishing job metadata to the content store and posting the request
//! on chain is shared between lineage bookkeeping (verification, cycle,
//! recovery runs) and the venture dispatcher.

use alloy_primitives::{Address, B256};
use mech_chain::{ChainError, ChainGateway, TxReceipt};
use mech_core::{JobMetadata, RequestId};
use mech_store::ContentStore;
use std::sync::Arc;
use tracing::debug;

/// Posts new requests at the marketplace through the service Safe.
pub struct Dispatcher {
    store: Arc<ContentStore>,
    chain: Arc<ChainGateway>,
    /// The service Safe submitting transactions.
    safe: Address,
    /// The mech new requests are directed at.
    mech: Address,
}

impl Dispatcher {
    /// Wire a dispatcher for one service.
    pub fn new(
        store: Arc<ContentStore>,
        chain: Arc<ChainGateway>,
        safe: Address,
        mech: Address,
    ) -> Self {
        Self {
            store,
            chain,
            safe,
            mech,
        }
    }

    /// The mech this dispatcher targets.
    #[must_use]
    pub fn mech(&self) -> Address {
        self.mech
    }

    /// Publish `metadata` and post an on-chain request pointing at it.
    pub async fn dispatch(&self, metadata: &JobMetadata) -> Result<RequestId, ChainError> {
        let (cid, digest_hex) = self
            .store
            .put_json(metadata)
            .await
            .map_err(|e| ChainError::Unknown(format!("metadata publish: {e}")))?;
        let digest: B256 = digest_hex
            .parse()
            .map_err(|_| ChainError::Unknown("digest shape".to_string()))?;
        debug!(target: "mech.delivery", %cid, job = %metadata.job_definition_id, "dispatching request");
        self.chain.dispatch_request(self.safe, self.mech, digest).await
    }

    /// Submit `deliver(request_id, digest)` through the Safe.
    pub async fn deliver(
        &self,
        request_id: RequestId,
        digest: B256,
    ) -> Result<TxReceipt, ChainError> {
        self.chain.deliver(self.safe, request_id, digest).await
    }
}
