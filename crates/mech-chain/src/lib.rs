// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-chain
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Read/write access to the marketplace, service registry, staking, and
//! Safe multisig contracts. Reads go through typed `eth_call`s; writes are
//! EIP-1559 transactions signed with the operator key, either directly or
//! wrapped in a Safe `execTransaction` with a pre-flight simulation.

/// Typed contract call and event definitions.
pub mod contracts;
/// Error classification for the pipeline taxonomy.
pub mod error;
/// JSON-RPC transport.
pub mod rpc;

pub use error::ChainError;
pub use rpc::{RpcClient, RpcLog, TxReceipt};

use alloy_consensus::{SignableTransaction, TxEip1559};
use alloy_eips::eip2718::Encodable2718;
use alloy_eips::eip2930::AccessList;
use alloy_primitives::{Address, B256, TxKind, U256};
use alloy_sol_types::SolCall;
use contracts::{
    createCall, getServiceCall, getServiceInfoCall, getStakingStateCall, ownerOfCall,
};
use mech_core::RequestId;
use mech_signer::OperatorSigner;
use std::time::Duration;
use tracing::{debug, info};

/// Service registry state for a fully deployed service.
pub const SERVICE_STATE_DEPLOYED: u8 = 4;
/// Staking contract state for an actively staked service.
pub const STAKING_STATE_STAKED: u8 = 1;

/// Receipt polling interval.
const RECEIPT_POLL: Duration = Duration::from_secs(2);
/// Give up waiting for a receipt after this many polls.
const RECEIPT_POLL_LIMIT: u32 = 90;

/// Contract addresses the gateway talks to.
#[derive(Debug, Clone, Copy)]
pub struct ChainAddresses {
    /// Mech marketplace.
    pub marketplace: Address,
    /// Service registry.
    pub registry: Address,
    /// Staking contract.
    pub staking: Address,
}

/// A service registry record, trimmed to what the worker consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRecord {
    /// The service's Safe multisig.
    pub multisig: Address,
    /// Registry state byte; [`SERVICE_STATE_DEPLOYED`] means deployed.
    pub state: u8,
}

/// The chain gateway: typed reads plus gas-aware submission.
pub struct ChainGateway {
    rpc: RpcClient,
    signer: OperatorSigner,
    addresses: ChainAddresses,
    confirmations: u64,
}

impl ChainGateway {
    /// Build a gateway over the given RPC endpoint.
    pub fn new(
        rpc: RpcClient,
        signer: OperatorSigner,
        addresses: ChainAddresses,
        confirmations: u64,
    ) -> Self {
        Self {
            rpc,
            signer,
            addresses,
            confirmations,
        }
    }

    /// The operator address writes are signed with.
    #[must_use]
    pub fn operator(&self) -> Address {
        self.signer.address()
    }

    /// Contract addresses in use.
    #[must_use]
    pub fn addresses(&self) -> &ChainAddresses {
        &self.addresses
    }

    /// RPC transport (shared with boot-time probes).
    #[must_use]
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    // ── Reads ──────────────────────────────────────────────────────────

    /// `ServiceRegistry.getService(serviceId)`.
    pub async fn get_service(&self, service_id: u64) -> Result<ServiceRecord, ChainError> {
        let call = getServiceCall {
            serviceId: U256::from(service_id),
        };
        let ret = self
            .rpc
            .call_decoded::<getServiceCall>(self.addresses.registry, &call.abi_encode())
            .await?;
        Ok(ServiceRecord {
            multisig: ret.multisig,
            state: ret.state,
        })
    }

    /// `ServiceRegistry.ownerOf(serviceId)`.
    pub async fn owner_of(&self, service_id: u64) -> Result<Address, ChainError> {
        let call = ownerOfCall {
            serviceId: U256::from(service_id),
        };
        self.rpc
            .call_decoded::<ownerOfCall>(self.addresses.registry, &call.abi_encode())
            .await
    }

    /// `Staking.getStakingState(serviceId)`; 1 means staked.
    pub async fn staking_state(&self, service_id: u64) -> Result<u8, ChainError> {
        let call = getStakingStateCall {
            serviceId: U256::from(service_id),
        };
        self.rpc
            .call_decoded::<getStakingStateCall>(self.addresses.staking, &call.abi_encode())
            .await
    }

    /// `Staking.getServiceInfo(serviceId)`; the staked multisig overrides
    /// the registry's when the service is staked.
    pub async fn staked_multisig(&self, service_id: u64) -> Result<Address, ChainError> {
        let call = getServiceInfoCall {
            serviceId: U256::from(service_id),
        };
        let info = self
            .rpc
            .call_decoded::<getServiceInfoCall>(self.addresses.staking, &call.abi_encode())
            .await?;
        Ok(info.multisig)
    }

    /// Resolve the effective Safe for a service: the staked multisig when
    /// staked, the registry multisig otherwise.
    pub async fn resolve_service_safe(&self, service_id: u64) -> Result<Address, ChainError> {
        if self.staking_state(service_id).await? == STAKING_STATE_STAKED {
            let staked = self.staked_multisig(service_id).await?;
            if staked != Address::ZERO {
                return Ok(staked);
            }
        }
        Ok(self.get_service(service_id).await?.multisig)
    }

    // ── Writes ─────────────────────────────────────────────────────────

    /// `Marketplace.create(serviceId, factory, abi.encode(price))`, waiting
    /// for the `CreateMech` event that matches the expected service id.
    pub async fn create_mech(
        &self,
        service_id: u64,
        factory: Address,
        request_price_wei: U256,
    ) -> Result<Address, ChainError> {
        let payload = contracts::encode_deploy_payload(request_price_wei);
        let call = createCall {
            serviceId: U256::from(service_id),
            factory,
            payload: payload.into(),
        };
        let receipt = self
            .submit_eoa(self.addresses.marketplace, U256::ZERO, call.abi_encode())
            .await?;
        contracts::find_created_mech(&receipt.logs, service_id).ok_or_else(|| {
            ChainError::Decode(format!(
                "no CreateMech event for service {service_id} in tx {}",
                receipt.transaction_hash
            ))
        })
    }

    /// Claim a request through the service Safe; a successful receipt is
    /// the worker's lease.
    pub async fn claim_request(
        &self,
        safe: Address,
        request_id: RequestId,
    ) -> Result<TxReceipt, ChainError> {
        let call = contracts::claimCall {
            requestId: request_id.0,
        };
        self.submit_via_safe(safe, self.addresses.marketplace, U256::ZERO, call.abi_encode())
            .await
    }

    /// Deliver a request's result digest through the service Safe.
    pub async fn deliver(
        &self,
        safe: Address,
        request_id: RequestId,
        digest: B256,
    ) -> Result<TxReceipt, ChainError> {
        let call = contracts::deliverCall {
            requestId: request_id.0,
            deliveryData: digest,
        };
        self.submit_via_safe(safe, self.addresses.marketplace, U256::ZERO, call.abi_encode())
            .await
    }

    /// Post a new request at the marketplace through the service Safe and
    /// return the id the marketplace assigned.
    pub async fn dispatch_request(
        &self,
        safe: Address,
        mech: Address,
        digest: B256,
    ) -> Result<RequestId, ChainError> {
        let call = contracts::requestCall {
            mech,
            requestData: digest,
        };
        let receipt = self
            .submit_via_safe(safe, self.addresses.marketplace, U256::ZERO, call.abi_encode())
            .await?;
        contracts::find_request_created(&receipt.logs, mech)
            .map(RequestId)
            .ok_or_else(|| {
                ChainError::Decode(format!(
                    "no RequestCreated event in tx {}",
                    receipt.transaction_hash
                ))
            })
    }

    /// Sign and submit an EIP-1559 transaction from the operator account,
    /// then wait for the configured confirmation depth.
    pub async fn submit_eoa(
        &self,
        to: Address,
        value: U256,
        data: Vec<u8>,
    ) -> Result<TxReceipt, ChainError> {
        self.submit_raw(to, value, data, None).await
    }

    /// Safe submission: simulate the inner call from the Safe, read the
    /// Safe nonce, compute and sign the transaction hash (eth_sign style,
    /// `v + 4`), then call `execTransaction` with a fixed 5M gas limit.
    pub async fn submit_via_safe(
        &self,
        safe: Address,
        to: Address,
        value: U256,
        data: Vec<u8>,
    ) -> Result<TxReceipt, ChainError> {
        // Pre-flight: catch contract reverts before spending gas.
        if let Err(err) = self.rpc.call(Some(safe), to, &data).await {
            return Err(match err {
                ChainError::Reverted { reason } => ChainError::SimRevert { reason },
                other => other,
            });
        }

        let nonce: U256 = self
            .rpc
            .call_decoded::<contracts::nonceCall>(safe, &contracts::nonceCall {}.abi_encode())
            .await?;

        let hash_call = contracts::getTransactionHashCall {
            to,
            value,
            data: data.clone().into(),
            operation: 0, // CALL
            safeTxGas: U256::ZERO,
            baseGas: U256::ZERO,
            gasPrice: U256::ZERO,
            gasToken: Address::ZERO,
            refundReceiver: Address::ZERO,
            _nonce: nonce,
        };
        let tx_hash: B256 = self
            .rpc
            .call_decoded::<contracts::getTransactionHashCall>(safe, &hash_call.abi_encode())
            .await?;

        let signature = self
            .signer
            .sign_safe_hash(tx_hash)
            .map_err(|e| ChainError::Unknown(e.to_string()))?;

        let exec = contracts::execTransactionCall {
            to,
            value,
            data: data.into(),
            operation: 0,
            safeTxGas: U256::ZERO,
            baseGas: U256::ZERO,
            gasPrice: U256::ZERO,
            gasToken: Address::ZERO,
            refundReceiver: Address::ZERO,
            signatures: signature.to_vec().into(),
        };

        debug!(target: "mech.chain", %safe, %to, nonce = %nonce, "submitting execTransaction");
        let receipt = self
            .submit_raw(safe, U256::ZERO, exec.abi_encode(), Some(5_000_000))
            .await;
        match receipt {
            Err(ChainError::Reverted { reason }) => Err(ChainError::SafeTxRevert { reason }),
            other => other,
        }
    }

    async fn submit_raw(
        &self,
        to: Address,
        value: U256,
        data: Vec<u8>,
        gas_limit: Option<u64>,
    ) -> Result<TxReceipt, ChainError> {
        let from = self.signer.address();
        let nonce = self.rpc.transaction_count(from).await?;
        let gas_limit = match gas_limit {
            Some(limit) => limit,
            // Pad the estimate; marketplace calls touch cold storage.
            None => self.rpc.estimate_gas(from, to, value, &data).await? * 6 / 5,
        };
        let max_priority_fee_per_gas = self.rpc.max_priority_fee().await.unwrap_or(1_000_000_000);
        let max_fee_per_gas = self
            .rpc
            .gas_price()
            .await?
            .saturating_mul(2)
            .max(max_priority_fee_per_gas);

        let tx = TxEip1559 {
            chain_id: self.signer.chain_id(),
            nonce,
            gas_limit,
            max_fee_per_gas,
            max_priority_fee_per_gas,
            to: TxKind::Call(to),
            value,
            access_list: AccessList::default(),
            input: data.into(),
        };
        let signature = self
            .signer
            .sign_hash(&tx.signature_hash())
            .map_err(|e| ChainError::Unknown(e.to_string()))?;
        let raw = tx.into_signed(signature).encoded_2718();

        let tx_hash = self.rpc.send_raw_transaction(&raw).await?;
        info!(target: "mech.chain", %tx_hash, %to, "transaction submitted");
        self.wait_for_receipt(tx_hash).await
    }

    /// Poll until the receipt lands and has the configured depth.
    ///
    /// Confirmations of 0 and 1 behave identically: the receipt itself is
    /// the evidence. Deeper settings wait for further blocks.
    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt, ChainError> {
        let mut polls = 0u32;
        let receipt = loop {
            if let Some(receipt) = self.rpc.transaction_receipt(tx_hash).await? {
                break receipt;
            }
            polls += 1;
            if polls >= RECEIPT_POLL_LIMIT {
                return Err(ChainError::Rpc(format!("receipt for {tx_hash} never arrived")));
            }
            tokio::time::sleep(RECEIPT_POLL).await;
        };

        if self.confirmations > 1 {
            let target = receipt.block_number + self.confirmations - 1;
            loop {
                if self.rpc.block_number().await? >= target {
                    break;
                }
                polls += 1;
                if polls >= RECEIPT_POLL_LIMIT {
                    return Err(ChainError::Rpc(format!(
                        "confirmations for {tx_hash} never reached {target}"
                    )));
                }
                tokio::time::sleep(RECEIPT_POLL).await;
            }
        }

        if !receipt.succeeded() {
            return Err(ChainError::Reverted { reason: None });
        }
        Ok(receipt)
    }
}
