// SPDX-License-Identifier: MIT OR Apache-2.0
//! Final-status inference.
//!
//! Precedence, strictly ordered:
//! 1. an explicit agent-reported status,
//! 2. a semantic scan of the output for failure statements,
//! 3. child-state aggregation (delegation),
//! 4. `COMPLETED`.

use mech_agent::AgentOutcome;
use mech_core::DeliveryStatus;

/// Tool whose successful invocation marks a delegation.
pub const DISPATCH_TOOL: &str = "dispatch_new_job";

/// Inability phrasings that mark a failure even without a status line.
const INABILITY_MARKERS: &[&str] = &[
    "i cannot complete",
    "i am unable to complete",
    "i was unable to complete",
    "cannot be completed",
];

/// The inferred status plus the message that justified it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferredStatus {
    /// Final status for the delivery payload.
    pub status: DeliveryStatus,
    /// Human-readable justification.
    pub message: String,
}

/// Infer the final status for one run.
///
/// `children_pending` reflects the post-execution indexer view of this
/// job's children.
#[must_use]
pub fn infer(outcome: &AgentOutcome, children_pending: bool) -> InferredStatus {
    // 1. Explicit wins over everything.
    if let Some(status) = outcome.reported_status {
        return InferredStatus {
            status,
            message: format!("agent reported {status}"),
        };
    }

    // 2. Semantic scan beats child aggregation.
    if let Some(message) = scan_for_failure(&outcome.output) {
        return InferredStatus {
            status: DeliveryStatus::Failed,
            message,
        };
    }

    // 3. Child aggregation.
    if children_pending {
        let dispatched_now = outcome.telemetry.called(DISPATCH_TOOL);
        let status = if dispatched_now {
            DeliveryStatus::Delegating
        } else {
            DeliveryStatus::Waiting
        };
        return InferredStatus {
            status,
            message: if dispatched_now {
                "child jobs dispatched and still running".to_string()
            } else {
                "waiting on incomplete child jobs".to_string()
            },
        };
    }

    // 4. Default.
    InferredStatus {
        status: DeliveryStatus::Completed,
        message: "mission completed".to_string(),
    }
}

/// Scan output text for an explicit failure statement.
///
/// Handles markdown emphasis (`**Status:** FAILED`) and inability
/// phrasings. Returns the extracted message when found.
#[must_use]
pub fn scan_for_failure(output: &str) -> Option<String> {
    for line in output.lines() {
        let normalized: String = line
            .chars()
            .filter(|c| *c != '*' && *c != '_' && *c != '`')
            .collect();
        let trimmed = normalized.trim();
        let lowered = trimmed.to_lowercase();

        if let Some(rest) = lowered.strip_prefix("status:") {
            if rest.trim().starts_with("failed") {
                let detail = trimmed
                    .splitn(2, ':')
                    .nth(1)
                    .map(str::trim)
                    .unwrap_or("FAILED");
                return Some(detail.to_string());
            }
            continue;
        }

        if INABILITY_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            return Some(trimmed.to_string());
        }
    }
    None
}
