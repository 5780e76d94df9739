// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent execution results and tool-call telemetry.

use crate::delivery::DeliveryStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One tool invocation observed during an agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Tool name as the agent reported it.
    pub tool: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Wall-clock duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Error text for failed calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured result payload, when the tool returned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// A content-addressed artifact reference extracted from a run.
///
/// De-duplication key is `(cid, topic)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    /// Content identifier of the artifact payload.
    pub cid: String,
    /// Topic channel the artifact was published under.
    pub topic: String,
    /// Display name, when provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Artifact type tag (e.g. `MEASUREMENT`, `MEMORY`, `WORKER_TELEMETRY`).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ArtifactRef {
    /// The `(cid, topic)` de-duplication key.
    #[must_use]
    pub fn dedup_key(&self) -> (&str, &str) {
        (&self.cid, &self.topic)
    }
}

/// Telemetry captured across one agent run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTelemetry {
    /// Tool invocations in call order.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Vendor-specific counters (tokens, turns, retries).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    /// Loop-protection message when the agent terminated itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_message: Option<String>,
}

impl AgentTelemetry {
    /// Successful calls of the named tool, in order.
    pub fn successful_calls<'a>(&'a self, tool: &'a str) -> impl Iterator<Item = &'a ToolCall> {
        self.tool_calls
            .iter()
            .filter(move |c| c.success && c.tool == tool)
    }

    /// `true` when any call of the named tool succeeded.
    #[must_use]
    pub fn called(&self, tool: &str) -> bool {
        self.successful_calls(tool).next().is_some()
    }
}

/// The pipeline-facing outcome of one agent run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Full output text.
    pub output: String,
    /// Structured summary, when the agent produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_summary: Option<serde_json::Value>,
    /// Final status the agent reported explicitly, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_status: Option<DeliveryStatus>,
    /// Telemetry for the run.
    #[serde(default)]
    pub telemetry: AgentTelemetry,
    /// `true` when the agent dispatched child jobs.
    #[serde(default)]
    pub delegated: bool,
    /// Artifacts extracted from the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(tool: &str, success: bool) -> ToolCall {
        ToolCall {
            tool: tool.into(),
            success,
            duration_ms: 5,
            error: None,
            result: None,
        }
    }

    #[test]
    fn successful_calls_filters_by_name_and_success() {
        let telemetry = AgentTelemetry {
            tool_calls: vec![
                call("create_artifact", true),
                call("create_artifact", false),
                call("dispatch_new_job", true),
            ],
            ..Default::default()
        };
        assert_eq!(telemetry.successful_calls("create_artifact").count(), 1);
        assert!(telemetry.called("dispatch_new_job"));
        assert!(!telemetry.called("missing_tool"));
    }

    #[test]
    fn artifact_type_field_is_renamed() {
        let a = ArtifactRef {
            cid: "bafy".into(),
            topic: "T".into(),
            name: None,
            kind: Some("MEASUREMENT".into()),
            tags: vec![],
        };
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["type"], "MEASUREMENT");
    }

    #[test]
    fn dedup_key_is_cid_and_topic() {
        let a = ArtifactRef {
            cid: "bafy".into(),
            topic: "T".into(),
            name: Some("n".into()),
            kind: None,
            tags: vec![],
        };
        assert_eq!(a.dedup_key(), ("bafy", "T"));
    }
}
