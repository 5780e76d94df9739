// SPDX-License-Identifier: MIT OR Apache-2.0
//! Delivery payload and terminal status model.

use crate::execution::{AgentTelemetry, ArtifactRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Final status written into a delivery payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// The job finished its mission.
    Completed,
    /// The job terminated with a fault; the payload message carries it.
    Failed,
    /// The job handed work to children that are still running.
    Delegating,
    /// The job is blocked on dependencies and was re-queued.
    Waiting,
}

impl DeliveryStatus {
    /// `true` for statuses that end the request's lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Delegating => "DELEGATING",
            Self::Waiting => "WAITING",
        };
        f.write_str(s)
    }
}

/// The content-addressed payload written exactly once per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    /// Terminal (or delegating/waiting) status.
    pub status: DeliveryStatus,
    /// Human-readable outcome summary or failure cause.
    pub message: String,
    /// Full agent output.
    pub output: String,
    /// Model the agent ran with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Run telemetry.
    #[serde(default)]
    pub telemetry: AgentTelemetry,
    /// Artifacts produced by the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    /// Pull-request URL for coding jobs that pushed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_screaming_snake_on_the_wire() {
        assert_eq!(
            serde_json::to_value(DeliveryStatus::Completed).unwrap(),
            "COMPLETED"
        );
        assert_eq!(
            serde_json::from_str::<DeliveryStatus>("\"DELEGATING\"").unwrap(),
            DeliveryStatus::Delegating
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(DeliveryStatus::Completed.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Delegating.is_terminal());
        assert!(!DeliveryStatus::Waiting.is_terminal());
    }

    #[test]
    fn payload_roundtrip() {
        let payload = DeliveryPayload {
            status: DeliveryStatus::Completed,
            message: "done".into(),
            output: "output".into(),
            model: Some("default".into()),
            telemetry: AgentTelemetry::default(),
            artifacts: vec![],
            pr_url: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: DeliveryPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
