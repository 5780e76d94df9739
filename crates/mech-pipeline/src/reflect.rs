// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reflection pass.
//!
//! A second, lightweight agent invocation with only the create-artifact
//! tool available. Its single purpose is to optionally emit a MEMORY
//! artifact summarizing what the run learned; its failure is never fatal.

use crate::status::InferredStatus;
use mech_agent::AgentOutcome;
use mech_context::JobContext;
use std::fmt::Write as _;

/// The only tool offered to the reflection run.
pub const REFLECTION_TOOL: &str = "create_artifact";

/// Render the short reflection prompt: outcome plus telemetry digest.
#[must_use]
pub fn render_prompt(
    context: &JobContext,
    inferred: &InferredStatus,
    outcome: &AgentOutcome,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Reflection: {} ({})",
        context.metadata.job_name, inferred.status
    );
    let _ = writeln!(out, "Outcome: {}", inferred.message);

    let calls = &outcome.telemetry.tool_calls;
    let failures: Vec<&str> = calls
        .iter()
        .filter(|c| !c.success)
        .map(|c| c.tool.as_str())
        .collect();
    let _ = writeln!(
        out,
        "Telemetry: {} tool calls, {} failed{}",
        calls.len(),
        failures.len(),
        if failures.is_empty() {
            String::new()
        } else {
            format!(" ({})", failures.join(", "))
        }
    );

    let _ = writeln!(
        out,
        "\nIf this run produced a lesson worth keeping for future runs of this \
         workstream, publish one MEMORY artifact with the {REFLECTION_TOOL} tool. \
         If not, finish without publishing anything."
    );
    out
}
