// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed contract call and event definitions.
//!
//! Only the surface the worker actually touches. The registry, staking,
//! and Safe signatures are fixed by the deployed contracts; the
//! marketplace claim/request/deliver trio is isolated here so an ABI
//! change stays a one-file edit.

#![allow(missing_docs)] // sol! expansion has no doc comments.

use crate::rpc::RpcLog;
use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::{SolEvent, SolValue, sol};

sol! {
    // ── ServiceRegistry ────────────────────────────────────────────────
    function getService(uint256 serviceId) external view returns (
        uint96 securityDeposit,
        address multisig,
        bytes32 configHash,
        uint32 threshold,
        uint32 maxNumAgentInstances,
        uint32 numAgentInstances,
        uint8 state
    );
    function ownerOf(uint256 serviceId) external view returns (address owner);

    // ── Staking ────────────────────────────────────────────────────────
    function getStakingState(uint256 serviceId) external view returns (uint8 stakingState);
    function getServiceInfo(uint256 serviceId) external view returns (
        address multisig,
        address owner,
        uint256 nonces,
        uint256 tsStart,
        uint256 reward,
        uint256 inactivity
    );

    // ── MechMarketplace ────────────────────────────────────────────────
    function create(uint256 serviceId, address factory, bytes payload) external returns (address mech);
    function claim(bytes32 requestId) external;
    function request(address mech, bytes32 requestData) external returns (bytes32 requestId);
    function deliver(bytes32 requestId, bytes32 deliveryData) external;

    event CreateMech(address indexed mech, uint256 indexed serviceId, address indexed factory);
    event RequestCreated(address indexed mech, bytes32 indexed requestId, bytes32 data);

    // ── Safe v1.3 ──────────────────────────────────────────────────────
    function nonce() external view returns (uint256);
    function getTransactionHash(
        address to,
        uint256 value,
        bytes data,
        uint8 operation,
        uint256 safeTxGas,
        uint256 baseGas,
        uint256 gasPrice,
        address gasToken,
        address refundReceiver,
        uint256 _nonce
    ) external view returns (bytes32);
    function execTransaction(
        address to,
        uint256 value,
        bytes data,
        uint8 operation,
        uint256 safeTxGas,
        uint256 baseGas,
        uint256 gasPrice,
        address gasToken,
        address payable refundReceiver,
        bytes signatures
    ) external payable returns (bool success);
}

/// Deploy-mech payload: `abi.encode(uint256 requestPriceWei)`.
#[must_use]
pub fn encode_deploy_payload(request_price_wei: U256) -> Vec<u8> {
    request_price_wei.abi_encode()
}

/// Scan receipt logs for `CreateMech` and return the mech address, but
/// only when the event's service id matches the expected one. Guards
/// against log reordering and concurrent creations in the same block.
#[must_use]
pub fn find_created_mech(logs: &[RpcLog], expected_service_id: u64) -> Option<Address> {
    for log in logs {
        if log.topics.first() != Some(&CreateMech::SIGNATURE_HASH) || log.topics.len() < 4 {
            continue;
        }
        let service_id = U256::from_be_bytes(log.topics[2].0);
        if service_id != U256::from(expected_service_id) {
            continue;
        }
        return Some(Address::from_word(log.topics[1]));
    }
    None
}

/// Scan receipt logs for `RequestCreated` from a dispatch, matching the
/// mech the request was directed at.
#[must_use]
pub fn find_request_created(logs: &[RpcLog], expected_mech: Address) -> Option<B256> {
    for log in logs {
        if log.topics.first() != Some(&RequestCreated::SIGNATURE_HASH) || log.topics.len() < 3 {
            continue;
        }
        if Address::from_word(log.topics[1]) != expected_mech {
            continue;
        }
        return Some(log.topics[2]);
    }
    None
}
