// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parent/child job hierarchy nodes.
//!
//! The hierarchy is a derived view over indexer data, alive for one job
//! execution. Nodes are stored in a map keyed by job-definition id with
//! adjacency lists for edges; references resolve by id lookup so a bounded
//! breadth-first walk never chases in-memory pointers.

use crate::request::RequestId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregate status of a job definition's runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// At least one run is still undelivered.
    Active,
    /// The latest run delivered COMPLETED.
    Completed,
    /// The latest run delivered FAILED.
    Failed,
    /// No runs observed, or delivery payloads unreadable.
    Unknown,
}

/// One job definition in the hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyNode {
    /// Job definition id.
    pub job_definition_id: String,
    /// Request ids of this definition's runs, oldest first.
    #[serde(default)]
    pub request_ids: Vec<RequestId>,
    /// Aggregate run status.
    pub status: NodeStatus,
    /// Artifact cids attached to this definition's runs.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Message references attached to this definition's runs.
    #[serde(default)]
    pub messages: Vec<String>,
    /// Branch this definition works on, for coding jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    /// Distance from the job under execution (0 = self).
    pub depth: u32,
}

/// The bounded hierarchy assembled around one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobHierarchy {
    /// Nodes keyed by job-definition id.
    pub nodes: BTreeMap<String, HierarchyNode>,
    /// Parent → children adjacency, by job-definition id.
    pub edges: BTreeMap<String, Vec<String>>,
}

impl JobHierarchy {
    /// Node lookup by job-definition id.
    #[must_use]
    pub fn node(&self, job_definition_id: &str) -> Option<&HierarchyNode> {
        self.nodes.get(job_definition_id)
    }

    /// Children of the given node, resolved through the adjacency list.
    pub fn children(&self, job_definition_id: &str) -> impl Iterator<Item = &HierarchyNode> {
        self.edges
            .get(job_definition_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.nodes.get(id))
    }

    /// `true` when any child of `job_definition_id` is still active.
    #[must_use]
    pub fn has_pending_children(&self, job_definition_id: &str) -> bool {
        self.children(job_definition_id)
            .any(|n| matches!(n.status, NodeStatus::Active | NodeStatus::Unknown))
    }

    /// `true` when at least one child completed.
    #[must_use]
    pub fn has_completed_children(&self, job_definition_id: &str) -> bool {
        self.children(job_definition_id)
            .any(|n| n.status == NodeStatus::Completed)
    }

    /// Insert a node and register it under its parent, if one is given.
    pub fn insert(&mut self, parent: Option<&str>, node: HierarchyNode) {
        if let Some(parent) = parent {
            let children = self.edges.entry(parent.to_string()).or_default();
            if !children.contains(&node.job_definition_id) {
                children.push(node.job_definition_id.clone());
            }
        }
        self.nodes.insert(node.job_definition_id.clone(), node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, status: NodeStatus, depth: u32) -> HierarchyNode {
        HierarchyNode {
            job_definition_id: id.into(),
            request_ids: vec![],
            status,
            artifacts: vec![],
            messages: vec![],
            branch_name: None,
            depth,
        }
    }

    #[test]
    fn children_resolve_by_id() {
        let mut h = JobHierarchy::default();
        h.insert(None, node("root", NodeStatus::Active, 0));
        h.insert(Some("root"), node("a", NodeStatus::Completed, 1));
        h.insert(Some("root"), node("b", NodeStatus::Active, 1));
        let ids: Vec<_> = h.children("root").map(|n| n.job_definition_id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn pending_and_completed_child_queries() {
        let mut h = JobHierarchy::default();
        h.insert(None, node("root", NodeStatus::Active, 0));
        h.insert(Some("root"), node("a", NodeStatus::Completed, 1));
        assert!(!h.has_pending_children("root"));
        assert!(h.has_completed_children("root"));

        h.insert(Some("root"), node("b", NodeStatus::Unknown, 1));
        assert!(h.has_pending_children("root"));
    }

    #[test]
    fn duplicate_insert_does_not_duplicate_edge() {
        let mut h = JobHierarchy::default();
        h.insert(None, node("root", NodeStatus::Active, 0));
        h.insert(Some("root"), node("a", NodeStatus::Active, 1));
        h.insert(Some("root"), node("a", NodeStatus::Completed, 1));
        assert_eq!(h.edges["root"].len(), 1);
        assert_eq!(h.node("a").unwrap().status, NodeStatus::Completed);
    }

    #[test]
    fn unknown_parent_yields_no_children() {
        let h = JobHierarchy::default();
        assert_eq!(h.children("nope").count(), 0);
        assert!(!h.has_pending_children("nope"));
    }
}
