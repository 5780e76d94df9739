// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-venture
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The control-plane venture dispatcher: given a venture, a due schedule
//! entry, and its template, substitute `{{path.expr}}` placeholders in the
//! template via a deep traversal, fold in the venture's invariants and
//! latest measurements, and post the resulting job at the marketplace.

use mech_core::{AdditionalContext, Invariant, JobMetadata, Measurement, RequestId};
use mech_delivery::dispatch::Dispatcher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

/// A long-running container for templates, invariants, and schedules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Venture {
    /// Stable venture id; doubles as the workstream scope.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Venture-scoped invariants folded into every dispatch.
    #[serde(default)]
    pub invariants: Vec<Invariant>,
}

/// A job template instantiated by schedule entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Stable template id.
    pub id: String,
    /// Job metadata with `{{path.expr}}` placeholders, as a JSON value.
    pub metadata: Value,
}

/// One due schedule slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    /// Template to instantiate.
    pub template_id: String,
    /// Input overrides substituted into the template.
    #[serde(default)]
    pub inputs: Value,
    /// Deterministic job-definition id for idempotent dispatch; a fresh
    /// random identifier is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_definition_id: Option<String>,
}

/// Dispatcher failures.
#[derive(Debug, thiserror::Error)]
pub enum VentureError {
    /// The substituted template is not valid job metadata.
    #[error("template does not produce job metadata: {0}")]
    BadTemplate(#[from] serde_json::Error),
    /// The on-chain dispatch failed.
    #[error(transparent)]
    Dispatch(#[from] mech_chain::ChainError),
}

/// Substitute `{{path.expr}}` placeholders throughout a JSON value.
///
/// Strings are scanned for `{{…}}` spans; each path resolves into `inputs`
/// by dot traversal. Arrays join with newlines, scalars render plainly,
/// and missing paths stay literal. Objects and arrays recurse.
#[must_use]
pub fn substitute(value: &Value, inputs: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(substitute_text(text, inputs)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| substitute(item, inputs)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| (key.clone(), substitute(val, inputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_text(text: &str, inputs: &Value) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // Unterminated span stays literal.
            out.push_str(&rest[start..]);
            return out;
        };
        let path = after[..end].trim();
        match resolve_path(inputs, path) {
            Some(resolved) => out.push_str(&resolved),
            None => {
                out.push_str(&rest[start..start + 2 + end + 2]);
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn resolve_path(inputs: &Value, path: &str) -> Option<String> {
    let mut cursor = inputs;
    for segment in path.split('.') {
        cursor = match cursor {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(render(cursor))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(render)
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Instantiates templates and posts them on chain.
pub struct VentureDispatcher {
    dispatcher: Dispatcher,
}

/// Compose the metadata for a due entry without dispatching.
///
/// Exposed separately so tests and dry-run tooling can inspect what would
/// be posted.
pub fn compose(
    venture: &Venture,
    template: &Template,
    entry: &ScheduleEntry,
    last_measurements: Vec<Measurement>,
) -> Result<JobMetadata, VentureError> {
    let substituted = substitute(&template.metadata, &entry.inputs);
    let mut metadata: JobMetadata = serde_json::from_value(substituted)?;

    metadata.job_definition_id = entry
        .job_definition_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    metadata.venture_id = Some(venture.id.clone());
    metadata.template_id = Some(template.id.clone());
    metadata.workstream_id.get_or_insert_with(|| venture.id.clone());

    let extra = metadata
        .additional_context
        .get_or_insert_with(AdditionalContext::default);
    if !venture.invariants.is_empty() {
        extra.venture_invariants = Some(venture.invariants.clone());
    }
    if !last_measurements.is_empty() {
        extra.last_measurements = Some(last_measurements);
    }
    Ok(metadata)
}

impl VentureDispatcher {
    /// Wire over the shared marketplace dispatcher.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Compose and post a due entry; returns the new request id.
    pub async fn dispatch_due(
        &self,
        venture: &Venture,
        template: &Template,
        entry: &ScheduleEntry,
        last_measurements: Vec<Measurement>,
    ) -> Result<RequestId, VentureError> {
        let metadata = compose(venture, template, entry, last_measurements)?;
        let request_id = self.dispatcher.dispatch(&metadata).await?;
        info!(
            target: "mech.venture",
            venture = %venture.id,
            template = %template.id,
            request = %request_id,
            "scheduled dispatch posted"
        );
        Ok(request_id)
    }
}
