// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared fixtures for pipeline unit tests.

use mech_context::JobContext;
use mech_core::{
    AdditionalContext, Blueprint, Invariant, JobMetadata, LoopRecovery, Request, RequestId,
};
use std::collections::BTreeMap;

pub fn boolean(id: &str) -> Invariant {
    Invariant::Boolean {
        id: id.to_string(),
        condition: format!("{id} holds"),
        assessment: "check".to_string(),
        examples: None,
    }
}

pub fn request() -> Request {
    Request {
        id: RequestId::ZERO,
        requester: alloy_primitives::Address::repeat_byte(0xaa),
        mech: alloy_primitives::Address::repeat_byte(0xbb),
        data: alloy_primitives::B256::repeat_byte(0xcc),
        workstream_id: Some("ws-test".to_string()),
        dependencies: vec![],
        delivered: false,
        block_timestamp: 0,
    }
}

pub fn metadata() -> JobMetadata {
    serde_json::from_value(serde_json::json!({
        "blueprint": "{\"invariants\":[]}",
        "jobDefinitionId": "jd-test",
        "jobName": "test job",
        "workstreamId": "ws-test",
    }))
    .unwrap()
}

pub fn context_with(invariants: Vec<Invariant>) -> JobContext {
    JobContext {
        request: request(),
        metadata: metadata(),
        blueprint: Blueprint {
            invariants,
            narrative: None,
        },
        hierarchy: Default::default(),
        measurements: BTreeMap::new(),
        required_tools: vec![],
        available_tools: vec!["create_artifact".to_string()],
        env: BTreeMap::new(),
    }
}

pub fn context_with_recovery(loop_message: &str, attempt: u32) -> JobContext {
    let mut context = context_with(vec![boolean("JOB-1")]);
    context.metadata.additional_context = Some(AdditionalContext {
        loop_recovery: Some(LoopRecovery {
            attempt,
            loop_message: loop_message.to_string(),
        }),
        ..Default::default()
    });
    context
}
