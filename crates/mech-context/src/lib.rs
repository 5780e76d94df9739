// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-context
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Composes the normalized [`JobContext`] for one claimed request:
//! metadata resolution (with legacy fallback), a bounded breadth-first
//! hierarchy walk, a newest-wins measurement fold, and tool-policy
//! derivation. Unreachable hierarchy nodes are logged and skipped; only
//! malformed metadata and missing required tools are fatal.

use mech_core::{
    Blueprint, Fault, FaultKind, HierarchyNode, JobHierarchy, JobMetadata, Measurement,
    NodeStatus, Request, Stage,
};
use mech_indexer::IndexerClient;
use mech_store::ContentStore;
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// Maximum hierarchy depth walked above the job under execution.
pub const MAX_HIERARCHY_DEPTH: u32 = 3;

/// How many measurement artifacts are folded per workstream.
const MEASUREMENT_LIMIT: u32 = 100;

/// Env keys that must never reach the agent even when metadata asks.
const BLOCKED_ENV_MARKERS: &[&str] = &["KEY", "SECRET", "TOKEN", "PASSWORD", "CREDENTIAL"];

/// The normalized input to the execution pipeline.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The claimed request.
    pub request: Request,
    /// Resolved job metadata.
    pub metadata: JobMetadata,
    /// Parsed, validated blueprint.
    pub blueprint: Blueprint,
    /// Bounded parent/child hierarchy around this job.
    pub hierarchy: JobHierarchy,
    /// Latest measurement per invariant id.
    pub measurements: BTreeMap<String, Measurement>,
    /// Tools that must be present (all verified against the registry).
    pub required_tools: Vec<String>,
    /// Tools the agent may use.
    pub available_tools: Vec<String>,
    /// Publicly-safe environment overrides for the agent.
    pub env: BTreeMap<String, String>,
}

impl JobContext {
    /// Workstream id, from metadata or the request.
    #[must_use]
    pub fn workstream_id(&self) -> Option<&str> {
        self.metadata
            .workstream_id
            .as_deref()
            .or(self.request.workstream_id.as_deref())
    }

    /// `true` when the job carries repository coordinates.
    #[must_use]
    pub fn is_coding_job(&self) -> bool {
        self.metadata.is_coding_job()
    }

    /// Completed children of the job under execution.
    #[must_use]
    pub fn has_completed_children(&self) -> bool {
        self.hierarchy
            .has_completed_children(&self.metadata.job_definition_id)
    }

    /// Mission invariant count (the agent's measurement set size).
    #[must_use]
    pub fn mission_invariant_count(&self) -> usize {
        self.blueprint.mission_invariants().len()
    }
}

/// Builds [`JobContext`]s from the store and the indexer.
pub struct ContextBuilder<'a> {
    store: &'a ContentStore,
    indexer: &'a IndexerClient,
    tool_registry: &'a HashSet<String>,
}

impl<'a> ContextBuilder<'a> {
    /// Wire a builder over the process-wide store and indexer.
    pub fn new(
        store: &'a ContentStore,
        indexer: &'a IndexerClient,
        tool_registry: &'a HashSet<String>,
    ) -> Self {
        Self {
            store,
            indexer,
            tool_registry,
        }
    }

    /// Build the context for a claimed request.
    pub async fn build(&self, request: &Request) -> Result<JobContext, Fault> {
        let metadata = self.resolve_metadata(request).await?;
        let blueprint = parse_blueprint(request, &metadata)?;

        let hierarchy = self.walk_hierarchy(&metadata).await;
        let measurements = self.fold_measurements(&metadata, request).await;
        let (required_tools, available_tools) = self.derive_tool_policy(request, &metadata)?;
        let env = filter_env(metadata.env.clone().unwrap_or_default());

        Ok(JobContext {
            request: request.clone(),
            metadata,
            blueprint,
            hierarchy,
            measurements,
            required_tools,
            available_tools,
            env,
        })
    }

    async fn resolve_metadata(&self, request: &Request) -> Result<JobMetadata, Fault> {
        let digest_hex = format!("{}", request.data);
        let bytes = self
            .store
            .get_by_digest(&digest_hex, Some(&request.id))
            .await
            .map_err(|e| {
                Fault::new(FaultKind::MalformedMetadata, Stage::Context, e.to_string())
                    .with_request(request.id)
            })?
            .ok_or_else(|| {
                Fault::new(
                    FaultKind::MalformedMetadata,
                    Stage::Context,
                    format!("metadata blob {digest_hex} not resolvable"),
                )
                .with_request(request.id)
            })?;

        serde_json::from_slice(&bytes).map_err(|e| {
            Fault::new(
                FaultKind::MalformedMetadata,
                Stage::Context,
                format!("metadata is not valid job JSON: {e}"),
            )
            .with_request(request.id)
        })
    }

    /// Breadth-first walk: ancestors up to [`MAX_HIERARCHY_DEPTH`], plus
    /// each visited node's children, runs, artifacts, and messages.
    /// Indexer failures skip the node.
    async fn walk_hierarchy(&self, metadata: &JobMetadata) -> JobHierarchy {
        let mut hierarchy = JobHierarchy::default();
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        let mut seen: HashSet<String> = HashSet::new();

        queue.push_back((metadata.job_definition_id.clone(), 0));
        while let Some((definition_id, depth)) = queue.pop_front() {
            if depth > MAX_HIERARCHY_DEPTH || !seen.insert(definition_id.clone()) {
                continue;
            }

            let record = match self.indexer.job_definition(&definition_id).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(target: "mech.context", %definition_id, error = %err, "hierarchy node unreachable");
                    continue;
                }
            };

            let mut node = self.load_node(&definition_id, depth).await;
            node.branch_name = record.as_ref().and_then(|r| r.branch_name.clone());
            let parent = record
                .as_ref()
                .and_then(|r| r.parent_job_definition_id.clone());
            hierarchy.insert(parent.as_deref(), node);

            if let Some(parent) = parent {
                queue.push_back((parent, depth + 1));
            }
            // Children of the node under execution feed delegation checks.
            if depth == 0
                && let Ok(children) = self.indexer.child_definitions(&definition_id).await
            {
                for child in children {
                    let mut child_node = self.load_node(&child.id, depth).await;
                    child_node.branch_name = child.branch_name.clone();
                    hierarchy.insert(Some(&definition_id), child_node);
                }
            }
        }
        hierarchy
    }

    async fn load_node(&self, definition_id: &str, depth: u32) -> HierarchyNode {
        let runs = self
            .indexer
            .requests_for_definition(definition_id)
            .await
            .unwrap_or_default();
        let artifacts = self
            .indexer
            .artifacts_for_definition(definition_id)
            .await
            .unwrap_or_default();
        let messages = self
            .indexer
            .messages_for_definition(definition_id)
            .await
            .unwrap_or_default();

        let status = if runs.is_empty() {
            NodeStatus::Unknown
        } else if runs.iter().any(|r| !r.request.delivered) {
            NodeStatus::Active
        } else {
            NodeStatus::Completed
        };

        HierarchyNode {
            job_definition_id: definition_id.to_string(),
            request_ids: runs.iter().map(|r| r.request.id).collect(),
            status,
            artifacts: artifacts.into_iter().map(|a| a.cid).collect(),
            messages: messages.into_iter().map(|m| m.id).collect(),
            branch_name: None,
            depth,
        }
    }

    /// Latest MEASUREMENT artifact per invariant id, newest wins.
    async fn fold_measurements(
        &self,
        metadata: &JobMetadata,
        request: &Request,
    ) -> BTreeMap<String, Measurement> {
        let mut folded: BTreeMap<String, Measurement> = BTreeMap::new();

        // Dispatcher-supplied measurements seed the fold.
        if let Some(context) = &metadata.additional_context
            && let Some(last) = &context.last_measurements
        {
            for measurement in last {
                fold_in(&mut folded, measurement.clone());
            }
        }

        let Some(workstream_id) = metadata
            .workstream_id
            .as_deref()
            .or(request.workstream_id.as_deref())
        else {
            return folded;
        };

        let artifacts = match self
            .indexer
            .artifacts(workstream_id, Some("MEASUREMENT"), MEASUREMENT_LIMIT)
            .await
        {
            Ok(artifacts) => artifacts,
            Err(err) => {
                warn!(target: "mech.context", error = %err, "measurement artifacts unreachable");
                return folded;
            }
        };

        for artifact in artifacts {
            let Ok(cid) = artifact.cid.parse::<cid::Cid>() else {
                debug!(target: "mech.context", cid = %artifact.cid, "unparseable measurement cid");
                continue;
            };
            match self.store.get_json::<Measurement>(&cid).await {
                Ok(Some(measurement)) => fold_in(&mut folded, measurement),
                Ok(None) => {
                    debug!(target: "mech.context", %cid, "measurement payload absent");
                }
                Err(err) => {
                    debug!(target: "mech.context", %cid, error = %err, "measurement payload unreadable");
                }
            }
        }
        folded
    }

    fn derive_tool_policy(
        &self,
        request: &Request,
        metadata: &JobMetadata,
    ) -> Result<(Vec<String>, Vec<String>), Fault> {
        let policy = metadata.tool_policy.clone().unwrap_or_default();
        let required = policy.required;

        let mut available: Vec<String> = Vec::new();
        for tool in required
            .iter()
            .chain(policy.available.iter())
            .chain(metadata.enabled_tools.iter())
        {
            if !available.contains(tool) {
                available.push(tool.clone());
            }
        }

        let missing: Vec<&String> = required
            .iter()
            .filter(|t| !self.tool_registry.contains(*t))
            .collect();
        if !missing.is_empty() {
            return Err(Fault::new(
                FaultKind::ToolUnavailable,
                Stage::Context,
                format!(
                    "required tools missing from registry: {}",
                    missing
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )
            .with_request(request.id));
        }

        // Only registered tools are offered to the agent.
        available.retain(|t| self.tool_registry.contains(t));
        Ok((required, available))
    }
}

fn fold_in(folded: &mut BTreeMap<String, Measurement>, measurement: Measurement) {
    match folded.get(&measurement.invariant_id) {
        Some(existing) if !existing.superseded_by(&measurement) => {}
        _ => {
            folded.insert(measurement.invariant_id.clone(), measurement);
        }
    }
}

fn parse_blueprint(request: &Request, metadata: &JobMetadata) -> Result<Blueprint, Fault> {
    Blueprint::parse(&metadata.blueprint).map_err(|err| {
        let kind = match &err {
            mech_core::blueprint::BlueprintError::Invalid(_) => FaultKind::InvalidBlueprint,
            _ => FaultKind::MalformedMetadata,
        };
        Fault::new(kind, Stage::Context, err.to_string()).with_request(request.id)
    })
}

/// Drop env keys whose names suggest secret material.
fn filter_env(env: BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.into_iter()
        .filter(|(key, _)| {
            let upper = key.to_uppercase();
            !BLOCKED_ENV_MARKERS.iter().any(|marker| upper.contains(marker))
        })
        .collect()
}
