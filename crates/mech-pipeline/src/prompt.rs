// SPDX-License-Identifier: MIT OR Apache-2.0
//! Prompt assembly from the composed invariant set.

use crate::providers::ComposedInvariants;
use mech_context::JobContext;
use mech_core::{Invariant, InvariantScope};
use std::fmt::Write as _;

/// Render the full prompt for one job.
#[must_use]
pub fn render(context: &JobContext, invariants: &ComposedInvariants) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Job: {}", context.metadata.job_name);
    let _ = writeln!(out, "Job definition: {}", context.metadata.job_definition_id);
    let _ = writeln!(out, "Request: {}", context.request.id);
    if let Some(workstream) = context.workstream_id() {
        let _ = writeln!(out, "Workstream: {workstream}");
    }
    out.push('\n');

    if let Some(narrative) = &context.blueprint.narrative {
        let _ = writeln!(out, "## Briefing\n{narrative}\n");
    }

    let mission = invariants.mission_set();
    if !mission.is_empty() {
        let _ = writeln!(
            out,
            "## Mission invariants\nMeasure each of these and publish a MEASUREMENT \
             artifact per invariant id.\n"
        );
        for invariant in mission {
            render_invariant(&mut out, invariant);
        }
        out.push('\n');
    }

    let mut wrote_system_header = false;
    for (domain, section) in &invariants.sections {
        let directives: Vec<&Invariant> = section
            .iter()
            .filter(|i| i.scope() == InvariantScope::System)
            .collect();
        if directives.is_empty() {
            continue;
        }
        if !wrote_system_header {
            let _ = writeln!(out, "## Directives");
            wrote_system_header = true;
        }
        let _ = writeln!(out, "### {domain}");
        for invariant in directives {
            render_invariant(&mut out, invariant);
        }
    }
    out.push('\n');

    if !context.available_tools.is_empty() {
        let _ = writeln!(out, "## Tools\nEnabled: {}", context.available_tools.join(", "));
        if !context.required_tools.is_empty() {
            let _ = writeln!(out, "Required: {}", context.required_tools.join(", "));
        }
        out.push('\n');
    }

    if !context.measurements.is_empty() {
        let _ = writeln!(out, "## Latest measurements");
        for (id, measurement) in &context.measurements {
            let _ = writeln!(
                out,
                "- {id}: {} ({})",
                measurement.value,
                if measurement.passed { "passed" } else { "failed" }
            );
        }
        out.push('\n');
    }

    let hierarchy = &context.hierarchy;
    if hierarchy.nodes.len() > 1 {
        let _ = writeln!(out, "## Job hierarchy");
        for node in hierarchy.nodes.values() {
            let _ = writeln!(
                out,
                "- {} (depth {}, {:?}, {} runs)",
                node.job_definition_id,
                node.depth,
                node.status,
                node.request_ids.len()
            );
        }
        out.push('\n');
    }

    out
}

fn render_invariant(out: &mut String, invariant: &Invariant) {
    match invariant {
        Invariant::Floor { id, metric, min, assessment, .. } => {
            let _ = writeln!(out, "- [{id}] FLOOR {metric} >= {min} :: {assessment}");
        }
        Invariant::Ceiling { id, metric, max, assessment, .. } => {
            let _ = writeln!(out, "- [{id}] CEILING {metric} <= {max} :: {assessment}");
        }
        Invariant::Range { id, metric, min, max, assessment, .. } => {
            let _ = writeln!(out, "- [{id}] RANGE {metric} in [{min}, {max}] :: {assessment}");
        }
        Invariant::Boolean { id, condition, assessment, examples } => {
            let _ = writeln!(out, "- [{id}] {condition} :: {assessment}");
            if let Some(examples) = examples {
                for example in examples {
                    let _ = writeln!(out, "    * {example}");
                }
            }
        }
    }
}
