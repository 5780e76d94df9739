// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed job metadata.
//!
//! The metadata blob referenced by a request's 32-byte digest. Immutable;
//! the worker only ever reads it. Field names follow the camelCase wire
//! format used by the store and the indexer.

use crate::blueprint::Invariant;
use crate::measurement::Measurement;
use crate::request::RequestId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tool policy annotations carried by job metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPolicy {
    /// Tools that must be present in the worker's registry.
    #[serde(default)]
    pub required: Vec<String>,
    /// Tools the agent may use when present.
    #[serde(default)]
    pub available: Vec<String>,
}

/// Repository coordinates for coding jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeMetadata {
    /// Remote URL; validated against the clone allowlist before use.
    pub repository_url: String,
    /// Branch the job works on, when pre-assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    /// Commit the branch was at when the job was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_commit: Option<String>,
    /// Branch to base new work on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
}

/// Dispatcher lineage recorded on child jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lineage {
    /// Request that dispatched this one.
    pub dispatcher_request: RequestId,
    /// Branch the dispatcher was working on, if a coding job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Cycle bookkeeping for cyclic job definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleInfo {
    /// Marks a run dispatched by the cycle scheduler rather than a user.
    #[serde(default)]
    pub is_cycle_run: bool,
    /// 1-based cycle counter.
    #[serde(default)]
    pub cycle_number: u32,
}

/// Loop-protection recovery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopRecovery {
    /// 1-based recovery attempt; dispatch stops after 3.
    pub attempt: u32,
    /// The terminating cause from the failed run.
    pub loop_message: String,
}

/// Context attached by dispatchers (verification, cycles, recovery,
/// venture invariants and prior measurements).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalContext {
    /// Set on parent verification runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_required: Option<bool>,
    /// Set on cycle runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<CycleInfo>,
    /// Set on loop-recovery runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_recovery: Option<LoopRecovery>,
    /// Venture-scoped invariants folded in by the venture dispatcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venture_invariants: Option<Vec<Invariant>>,
    /// Latest venture measurements at dispatch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_measurements: Option<Vec<Measurement>>,
}

impl AdditionalContext {
    /// `true` when no dispatcher context is present at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.verification_required.is_none()
            && self.cycle.is_none()
            && self.loop_recovery.is_none()
            && self.venture_invariants.is_none()
            && self.last_measurements.is_none()
    }
}

/// The content-addressed job specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    /// Blueprint JSON string (parsed by [`crate::Blueprint::parse`]).
    pub blueprint: String,
    /// Ordered set of tools enabled for the agent.
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    /// Required/available tool split, when annotated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_policy: Option<ToolPolicy>,
    /// Request that dispatched this job, for children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_request_id: Option<RequestId>,
    /// Workstream id propagated from the root request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workstream_id: Option<String>,
    /// Stable id of the job definition this run belongs to.
    pub job_definition_id: String,
    /// Human-readable job name.
    pub job_name: String,
    /// Repository coordinates for coding jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_metadata: Option<CodeMetadata>,
    /// Model hint for the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Re-dispatch a fresh run whenever one completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cyclic: Option<bool>,
    /// Schema the agent's structured output should satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    /// Venture this job was dispatched from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venture_id: Option<String>,
    /// Template the venture dispatcher instantiated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Requests that must deliver before this one runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<RequestId>>,
    /// Dispatcher lineage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<Lineage>,
    /// Environment overrides; only publicly-safe keys are injected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    /// Dispatcher-attached context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<AdditionalContext>,
}

impl JobMetadata {
    /// `true` when the job carries repository coordinates.
    #[must_use]
    pub fn is_coding_job(&self) -> bool {
        self.code_metadata.is_some()
    }

    /// `true` when this run exists to verify a parent's children.
    #[must_use]
    pub fn is_verification_run(&self) -> bool {
        self.additional_context
            .as_ref()
            .and_then(|c| c.verification_required)
            .unwrap_or(false)
    }

    /// Cycle info if this is a cycle run.
    #[must_use]
    pub fn cycle(&self) -> Option<&CycleInfo> {
        self.additional_context.as_ref()?.cycle.as_ref()
    }

    /// Loop-recovery info if this is a recovery run.
    #[must_use]
    pub fn loop_recovery(&self) -> Option<&LoopRecovery> {
        self.additional_context.as_ref()?.loop_recovery.as_ref()
    }
}
