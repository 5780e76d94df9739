// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end pipeline scenarios against a scripted agent, a local
//! blockstore, and a mocked indexer.

use mech_config::{AgentConfig, GitConfig};
use mech_core::{DeliveryStatus, FaultKind, Request, RequestId};
use mech_indexer::IndexerClient;
use mech_pipeline::{Pipeline, PipelineVerdict};
use mech_retry::BackoffPolicy;
use mech_store::ContentStore;
use mech_store::blockstore::Blockstore;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn graphql(data: serde_json::Value) -> ResponseTemplate {
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

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<ContentStore>,
    indexer: IndexerClient,
}

impl Harness {
    async fn new(server: &MockServer) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ContentStore::new(
            Blockstore::open(dir.path()).await.unwrap(),
            None,
        ));
        let indexer = IndexerClient::new(server.uri()).unwrap().with_policy(fast());
        Self {
            _dir: dir,
            store,
            indexer,
        }
    }

    fn pipeline(&self, script: &str, timeout_secs: u64) -> Pipeline {
        let agent = AgentConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout_secs,
            allowed_models: vec!["default".to_string()],
            default_model: Some("default".to_string()),
            reflection: false,
            tools: vec!["create_artifact".to_string(), "dispatch_new_job".to_string()],
        };
        let registry: HashSet<String> = ["create_artifact", "dispatch_new_job"]
            .into_iter()
            .map(String::from)
            .collect();
        Pipeline::new(
            self.store.clone(),
            self.indexer.clone(),
            registry,
            agent,
            GitConfig::default(),
            BTreeMap::new(),
        )
    }

    async fn request_with_metadata(&self, metadata: &serde_json::Value) -> Request {
        let (_cid, digest) = self.store.put_json(metadata).await.unwrap();
        Request {
            id: RequestId(alloy_primitives::B256::repeat_byte(0x01)),
            requester: alloy_primitives::Address::repeat_byte(0xaa),
            mech: alloy_primitives::Address::repeat_byte(0xbb),
            data: digest.parse().unwrap(),
            workstream_id: Some("ws-e2e".to_string()),
            dependencies: vec![],
            delivered: false,
            block_timestamp: 1_700_000_000,
        }
    }
}

fn simple_metadata() -> serde_json::Value {
    json!({
        "blueprint": "{\"invariants\":[{\"id\":\"JOB-1\",\"type\":\"BOOLEAN\",\"condition\":\"x\",\"assessment\":\"y\"}]}",
        "enabledTools": ["create_artifact"],
        "jobDefinitionId": "jd-e2e",
        "jobName": "e2e job",
        "workstreamId": "ws-e2e",
    })
}

async fn mount_empty(server: &MockServer) {
    Mock::given(method("POST"))
        .respond_with(graphql(json!({})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn s1_normal_completion_with_extracted_artifact() {
    let server = MockServer::start().await;
    mount_empty(&server).await;
    let harness = Harness::new(&server).await;

    let script = r#"
        cat > /dev/null
        echo '{"type":"tool_call","tool":"create_artifact","success":true,"durationMs":10,"result":{"cid":"bafyartifact","topic":"T"}}'
        echo '{"type":"result","output":"mission accomplished"}'
    "#;
    let pipeline = harness.pipeline(script, 20);
    let request = harness.request_with_metadata(&simple_metadata()).await;

    let run = pipeline.execute(&request).await;
    let PipelineVerdict::Deliver(payload) = &run.verdict else {
        panic!("expected delivery");
    };
    assert_eq!(payload.status, DeliveryStatus::Completed);
    assert_eq!(payload.output, "mission accomplished");
    assert_eq!(payload.artifacts.len(), 1);
    assert_eq!(payload.artifacts[0].cid, "bafyartifact");
    assert_eq!(payload.artifacts[0].topic, "T");
    assert_eq!(payload.model.as_deref(), Some("default"));
    assert!(run.fault_kind.is_none());
}

#[tokio::test]
async fn s3_malformed_blueprint_fails_citing_invariant() {
    let server = MockServer::start().await;
    mount_empty(&server).await;
    let harness = Harness::new(&server).await;

    let mut metadata = simple_metadata();
    metadata["blueprint"] = json!(
        "{\"invariants\":[{\"id\":\"X\",\"type\":\"RANGE\",\"metric\":\"m\",\"min\":10,\"max\":5,\"assessment\":\"a\"}]}"
    );
    let pipeline = harness.pipeline("cat > /dev/null; echo unreachable", 20);
    let request = harness.request_with_metadata(&metadata).await;

    let run = pipeline.execute(&request).await;
    let PipelineVerdict::Deliver(payload) = &run.verdict else {
        panic!("expected delivery");
    };
    assert_eq!(payload.status, DeliveryStatus::Failed);
    assert!(payload.message.contains("INVALID_BLUEPRINT"), "{}", payload.message);
    assert!(payload.message.contains('X'));
    assert_eq!(run.fault_kind, Some(FaultKind::InvalidBlueprint));
}

#[tokio::test]
async fn s4_delegation_inferred_from_undelivered_child() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("query ChildDefinitions"))
        .respond_with(graphql(json!({
            "jobDefinitions": {"items": [{"id": "jd-child", "parentJobDefinitionId": "jd-e2e"}]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("query RequestsForDefinition"))
        .and(body_string_contains("jd-child"))
        .respond_with(graphql(json!({
            "requests": {"items": [{
                "id": format!("0x{}", "09".repeat(32)),
                "requester": format!("0x{}", "aa".repeat(20)),
                "mech": format!("0x{}", "bb".repeat(20)),
                "data": format!("0x{}", "cc".repeat(32)),
                "delivered": false,
                "blockTimestamp": 7,
            }]}
        })))
        .mount(&server)
        .await;
    mount_empty(&server).await;
    let harness = Harness::new(&server).await;

    let script = r#"
        cat > /dev/null
        echo '{"type":"tool_call","tool":"dispatch_new_job","success":true,"durationMs":30}'
        echo '{"type":"result","output":"dispatched a child to handle the mission"}'
    "#;
    let pipeline = harness.pipeline(script, 20);
    let request = harness.request_with_metadata(&simple_metadata()).await;

    let run = pipeline.execute(&request).await;
    let PipelineVerdict::Deliver(payload) = &run.verdict else {
        panic!("expected delivery");
    };
    assert_eq!(payload.status, DeliveryStatus::Delegating);
}

#[tokio::test]
async fn agent_timeout_fails_with_captured_telemetry() {
    let server = MockServer::start().await;
    mount_empty(&server).await;
    let harness = Harness::new(&server).await;

    let script = r#"
        cat > /dev/null
        echo '{"type":"output","text":"started"}'
        sleep 30
    "#;
    let pipeline = harness.pipeline(script, 1);
    let request = harness.request_with_metadata(&simple_metadata()).await;

    let run = pipeline.execute(&request).await;
    let PipelineVerdict::Deliver(payload) = &run.verdict else {
        panic!("expected delivery");
    };
    assert_eq!(payload.status, DeliveryStatus::Failed);
    assert!(payload.message.contains("AGENT_TIMEOUT"));
    assert_eq!(payload.output, "started");
    assert_eq!(run.fault_kind, Some(FaultKind::AgentTimeout));
}

#[tokio::test]
async fn loop_terminated_run_carries_the_loop_message() {
    let server = MockServer::start().await;
    mount_empty(&server).await;
    let harness = Harness::new(&server).await;

    let script = r#"
        cat > /dev/null
        echo '{"type":"result","output":"stuck","telemetry":{"toolCalls":[],"loopMessage":"Repeating edit of file F"}}'
    "#;
    let pipeline = harness.pipeline(script, 20);
    let request = harness.request_with_metadata(&simple_metadata()).await;

    let run = pipeline.execute(&request).await;
    let PipelineVerdict::Deliver(payload) = &run.verdict else {
        panic!("expected delivery");
    };
    assert_eq!(payload.status, DeliveryStatus::Failed);
    assert!(payload.message.contains("LOOP_TERMINATED"));
    assert_eq!(run.fault_kind, Some(FaultKind::LoopTerminated));
    assert_eq!(run.loop_message.as_deref(), Some("Repeating edit of file F"));
}

#[tokio::test]
async fn unsatisfied_metadata_dependencies_requeue() {
    let dep_hex = format!("0x{}", "dd".repeat(32));
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("query RequestsByIds"))
        .respond_with(graphql(json!({
            "requests": {"items": [{
                "id": dep_hex,
                "requester": format!("0x{}", "aa".repeat(20)),
                "mech": format!("0x{}", "bb".repeat(20)),
                "data": format!("0x{}", "cc".repeat(32)),
                "delivered": false,
                "blockTimestamp": 3,
            }]}
        })))
        .mount(&server)
        .await;
    mount_empty(&server).await;
    let harness = Harness::new(&server).await;

    let mut metadata = simple_metadata();
    metadata["dependencies"] = json!([format!("0x{}", "dd".repeat(32))]);
    let pipeline = harness.pipeline("cat > /dev/null; echo should-not-run", 20);
    let request = harness.request_with_metadata(&metadata).await;

    let run = pipeline.execute(&request).await;
    let PipelineVerdict::Requeue { reason } = &run.verdict else {
        panic!("expected requeue, got {:?}", run.verdict);
    };
    assert!(reason.contains("dd"), "{reason}");
    assert!(run.fault_kind.is_none());
}
