// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stake view and claim submission over the chain gateway.

use alloy_primitives::Address;
use async_trait::async_trait;
use mech_chain::{ChainError, ChainGateway, STAKING_STATE_STAKED};
use mech_claim::{ClaimSubmitter, StakeView};
use mech_claim::credentials::BrokerClient;
use mech_core::RequestId;
use mech_gater::{AdmissionGater, StakedSetError, StakedSetSource};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Staked-operator source: the broker's operator directory filtered by the
/// staking contract. Without a broker, the set degrades to empty and the
/// gater's fail-open path applies.
pub struct BrokerStakeSource {
    broker: Option<BrokerClient>,
    chain: Arc<ChainGateway>,
}

impl BrokerStakeSource {
    /// Broker-backed source.
    pub fn new(broker: BrokerClient, chain: Arc<ChainGateway>) -> Self {
        Self {
            broker: Some(broker),
            chain,
        }
    }

    /// Source without a broker; every fetch fails and the gater serves
    /// its fail-open / fail-static policy.
    pub fn chain_only(chain: Arc<ChainGateway>) -> Self {
        Self {
            broker: None,
            chain,
        }
    }
}

#[async_trait]
impl StakedSetSource for BrokerStakeSource {
    async fn staked_operators(&self) -> Result<HashSet<Address>, StakedSetError> {
        let Some(broker) = &self.broker else {
            return Err(StakedSetError("no broker configured".to_string()));
        };
        let operators = broker
            .operators_network()
            .await
            .map_err(|e| StakedSetError(e.to_string()))?;

        let mut staked = HashSet::new();
        for operator in operators {
            let Some(service_id) = operator.service_id else {
                continue;
            };
            match self.chain.staking_state(service_id).await {
                Ok(state) if state == STAKING_STATE_STAKED => {
                    staked.insert(operator.address);
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(target: "mech.daemon", %err, service_id, "staking state unreadable");
                }
            }
        }
        Ok(staked)
    }
}

/// Claim loop stake gate backed by the admission gater's cached set.
pub struct GaterStakeView {
    gater: Arc<AdmissionGater<BrokerStakeSource>>,
}

impl GaterStakeView {
    /// Share the gater's cache with the claim loop.
    pub fn new(gater: Arc<AdmissionGater<BrokerStakeSource>>) -> Self {
        Self { gater }
    }
}

#[async_trait]
impl StakeView for GaterStakeView {
    async fn is_staked(&self, address: Address) -> bool {
        self.gater.is_staked(address).await
    }
}

/// Claim submission through the service Safe.
pub struct SafeClaimSubmitter {
    chain: Arc<ChainGateway>,
    safe: Address,
}

impl SafeClaimSubmitter {
    /// Wire a submitter for the resolved service Safe.
    pub fn new(chain: Arc<ChainGateway>, safe: Address) -> Self {
        Self { chain, safe }
    }
}

#[async_trait]
impl ClaimSubmitter for SafeClaimSubmitter {
    async fn claim(&self, request_id: RequestId) -> Result<(), ChainError> {
        self.chain.claim_request(self.safe, request_id).await.map(drop)
    }
}
