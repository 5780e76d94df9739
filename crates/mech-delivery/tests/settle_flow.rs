// SPDX-License-Identifier: MIT OR Apache-2.0
//! Settlement flows against mocked chain and indexer endpoints.

use alloy_primitives::{Address, B256};
use mech_chain::{ChainAddresses, ChainGateway, RpcClient};
use mech_core::{
    AgentTelemetry, Blueprint, DeliveryPayload, DeliveryStatus, FaultKind, JobMetadata, Request,
    RequestId,
};
use mech_delivery::dispatch::Dispatcher;
use mech_delivery::{DeliveryService, SettleOutcome};
use mech_indexer::IndexerClient;
use mech_pipeline::{PipelineRun, PipelineVerdict};
use mech_retry::BackoffPolicy;
use mech_signer::OperatorSigner;
use mech_store::ContentStore;
use mech_store::blockstore::Blockstore;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe512961708279feb1be6ae5538da033";
const MECH: Address = Address::repeat_byte(0xbb);

fn rpc_result(value: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0", "id": 1, "result": value,
    }))
}

fn graphql(data: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"data": data}))
}

fn fast() -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: 1,
        base: Duration::from_millis(1),
        cap: Duration::from_millis(1),
        jitter: 0.0,
    }
}

/// Mount a happy Safe submission flow; the receipt carries a
/// RequestCreated event so dispatches can decode their new request id.
async fn mount_chain(server: &MockServer) {
    let request_created = alloy_primitives::keccak256("RequestCreated(address,bytes32,bytes32)");
    Mock::given(method("POST"))
        .and(body_string_contains("eth_call"))
        .and(body_string_contains("affed0e0")) // Safe nonce()
        .respond_with(rpc_result(json!(format!("0x{:064x}", 1))))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_call"))
        .and(body_string_contains("d8d11f78")) // getTransactionHash
        .respond_with(rpc_result(json!(format!("0x{}", "ab".repeat(32)))))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_call"))
        .respond_with(rpc_result(json!("0x")))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_getTransactionCount"))
        .respond_with(rpc_result(json!("0x0")))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_gasPrice"))
        .respond_with(rpc_result(json!("0x3b9aca00")))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_maxPriorityFeePerGas"))
        .respond_with(rpc_result(json!("0x3b9aca00")))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_sendRawTransaction"))
        .respond_with(rpc_result(json!(format!("0x{}", "cd".repeat(32)))))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_getTransactionReceipt"))
        .respond_with(rpc_result(json!({
            "transactionHash": format!("0x{}", "cd".repeat(32)),
            "blockNumber": "0x10",
            "status": "0x1",
            "logs": [{
                "address": format!("0x{}", "0a".repeat(20)),
                "topics": [
                    format!("{request_created}"),
                    format!("0x{}{}", "00".repeat(12), "bb".repeat(20)),
                    format!("0x{}", "77".repeat(32)),
                ],
                "data": format!("0x{}", "00".repeat(32)),
            }],
        })))
        .mount(server)
        .await;
}

struct Harness {
    _dir: tempfile::TempDir,
    service: DeliveryService,
}

async fn harness(chain_server: &MockServer, indexer_server: &MockServer) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ContentStore::new(
        Blockstore::open(dir.path()).await.unwrap(),
        None,
    ));
    let indexer = IndexerClient::new(indexer_server.uri())
        .unwrap()
        .with_policy(fast());
    let chain = Arc::new(ChainGateway::new(
        RpcClient::new(chain_server.uri()).unwrap(),
        OperatorSigner::from_hex(KEY, 100).unwrap(),
        ChainAddresses {
            marketplace: Address::repeat_byte(0x0a),
            registry: Address::repeat_byte(0x0b),
            staking: Address::repeat_byte(0x0c),
        },
        1,
    ));
    let dispatcher = Dispatcher::new(store.clone(), chain, Address::repeat_byte(0x05), MECH);
    let service = DeliveryService::new(store.clone(), indexer.clone(), dispatcher)
        .with_policy(fast());
    Harness { _dir: dir, service }
}

fn metadata(cyclic: bool) -> JobMetadata {
    serde_json::from_value(json!({
        "blueprint": "{\"invariants\":[{\"id\":\"JOB-1\",\"type\":\"BOOLEAN\",\"condition\":\"x\",\"assessment\":\"y\"}]}",
        "jobDefinitionId": "jd-settle",
        "jobName": "settle job",
        "workstreamId": "ws-settle",
        "cyclic": cyclic,
    }))
    .unwrap()
}

fn context_for(metadata: JobMetadata) -> mech_context::JobContext {
    mech_context::JobContext {
        request: request(),
        blueprint: Blueprint::parse(&metadata.blueprint).unwrap(),
        metadata,
        hierarchy: Default::default(),
        measurements: BTreeMap::new(),
        required_tools: vec![],
        available_tools: vec![],
        env: BTreeMap::new(),
    }
}

fn request() -> Request {
    Request {
        id: RequestId(B256::repeat_byte(0x42)),
        requester: Address::repeat_byte(0xaa),
        mech: MECH,
        data: B256::repeat_byte(0xcc),
        workstream_id: Some("ws-settle".to_string()),
        dependencies: vec![],
        delivered: false,
        block_timestamp: 0,
    }
}

fn payload(status: DeliveryStatus) -> DeliveryPayload {
    DeliveryPayload {
        status,
        message: "done".to_string(),
        output: "output".to_string(),
        model: None,
        telemetry: AgentTelemetry::default(),
        artifacts: vec![],
        pr_url: None,
    }
}

fn run_with(
    verdict: PipelineVerdict,
    metadata: JobMetadata,
    fault_kind: Option<FaultKind>,
    loop_message: Option<String>,
) -> PipelineRun {
    PipelineRun {
        request: request(),
        context: Some(context_for(metadata)),
        verdict,
        fault_kind,
        loop_message,
        duration: Duration::from_secs(3),
    }
}

#[tokio::test]
async fn requeue_passes_through_without_writes() {
    let chain = MockServer::start().await;
    let indexer = MockServer::start().await;
    let h = harness(&chain, &indexer).await;

    let run = run_with(
        PipelineVerdict::Requeue {
            reason: "deps".to_string(),
        },
        metadata(false),
        None,
        None,
    );
    let outcome = h.service.settle(&run).await.unwrap();
    assert!(matches!(outcome, SettleOutcome::Requeued { reason } if reason == "deps"));
    // Nothing touched either endpoint.
    assert!(chain.received_requests().await.unwrap().is_empty());
    assert!(indexer.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn already_delivered_requests_are_not_resubmitted() {
    let chain = MockServer::start().await;
    let indexer = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("query RequestsByIds"))
        .respond_with(graphql(json!({
            "requests": {"items": [{
                "id": format!("0x{}", "42".repeat(32)),
                "requester": format!("0x{}", "aa".repeat(20)),
                "mech": format!("0x{}", "bb".repeat(20)),
                "data": format!("0x{}", "cc".repeat(32)),
                "delivered": true,
                "blockTimestamp": 1,
            }]}
        })))
        .mount(&indexer)
        .await;
    let h = harness(&chain, &indexer).await;

    let run = run_with(
        PipelineVerdict::Deliver(payload(DeliveryStatus::Completed)),
        metadata(false),
        None,
        None,
    );
    let outcome = h.service.settle(&run).await.unwrap();
    assert!(matches!(outcome, SettleOutcome::AlreadyDelivered));
    assert!(chain.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn completed_cyclic_run_settles_and_dispatches_next_cycle() {
    let chain = MockServer::start().await;
    mount_chain(&chain).await;
    let indexer = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(graphql(json!({})))
        .mount(&indexer)
        .await;
    let h = harness(&chain, &indexer).await;

    let run = run_with(
        PipelineVerdict::Deliver(payload(DeliveryStatus::Completed)),
        metadata(true),
        None,
        None,
    );
    let outcome = h.service.settle(&run).await.unwrap();
    let SettleOutcome::Delivered {
        digest_hex,
        dispatched,
    } = outcome
    else {
        panic!("expected delivered");
    };
    assert!(digest_hex.starts_with("0x"));
    assert_eq!(dispatched, vec![RequestId(B256::repeat_byte(0x77))]);

    // The telemetry artifact went to the indexer.
    let records = indexer.received_requests().await.unwrap();
    assert!(
        records
            .iter()
            .any(|r| String::from_utf8_lossy(&r.body).contains("createArtifact")),
        "telemetry artifact was persisted"
    );
}

#[tokio::test]
async fn loop_terminated_failure_redispatches_with_attempt_two() {
    let chain = MockServer::start().await;
    mount_chain(&chain).await;
    let indexer = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(graphql(json!({})))
        .mount(&indexer)
        .await;
    let h = harness(&chain, &indexer).await;

    let run = run_with(
        PipelineVerdict::Deliver(payload(DeliveryStatus::Failed)),
        metadata(false),
        Some(FaultKind::LoopTerminated),
        Some("Repeating edit of file F".to_string()),
    );
    let outcome = h.service.settle(&run).await.unwrap();
    let SettleOutcome::Delivered { dispatched, .. } = outcome else {
        panic!("expected delivered");
    };
    assert_eq!(dispatched.len(), 1, "recovery run dispatched");
}

#[tokio::test]
async fn exhausted_recovery_attempts_stop_dispatching() {
    let chain = MockServer::start().await;
    mount_chain(&chain).await;
    let indexer = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(graphql(json!({})))
        .mount(&indexer)
        .await;
    let h = harness(&chain, &indexer).await;

    let mut md = metadata(false);
    md.additional_context = Some(mech_core::AdditionalContext {
        loop_recovery: Some(mech_core::LoopRecovery {
            attempt: 3,
            loop_message: "still looping".to_string(),
        }),
        ..Default::default()
    });
    let run = run_with(
        PipelineVerdict::Deliver(payload(DeliveryStatus::Failed)),
        md,
        Some(FaultKind::LoopTerminated),
        Some("still looping".to_string()),
    );
    let outcome = h.service.settle(&run).await.unwrap();
    let SettleOutcome::Delivered { dispatched, .. } = outcome else {
        panic!("expected delivered");
    };
    assert!(dispatched.is_empty(), "attempt 4 must not dispatch");
}

#[tokio::test]
async fn simulation_revert_is_terminal() {
    let chain = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("eth_call"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": 3, "message": "execution reverted: AgentNotRegistered", "data": null},
        })))
        .mount(&chain)
        .await;
    let indexer = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(graphql(json!({})))
        .mount(&indexer)
        .await;
    let h = harness(&chain, &indexer).await;

    let run = run_with(
        PipelineVerdict::Deliver(payload(DeliveryStatus::Completed)),
        metadata(false),
        None,
        None,
    );
    let fault = h.service.settle(&run).await.unwrap_err();
    assert_eq!(fault.kind, FaultKind::SimRevert);
    assert!(fault.message.contains("AgentNotRegistered"));
}
