// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact extraction.
//!
//! Artifacts surface through two channels: structured tool-call results
//! (preferred) and a fallback scrape of the agent's output text for JSON
//! objects carrying `cid` + `topic`. Nested payloads (function-response
//! envelopes) are walked recursively. De-duplication key is `(cid, topic)`.

use mech_agent::AgentOutcome;
use mech_core::ArtifactRef;
use serde_json::Value;
use std::collections::HashSet;

/// Extract every artifact reference from one run.
#[must_use]
pub fn extract(outcome: &AgentOutcome) -> Vec<ArtifactRef> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut out: Vec<ArtifactRef> = Vec::new();

    // Channel 1: structured tool-call results.
    for call in &outcome.telemetry.tool_calls {
        if !call.success {
            continue;
        }
        if let Some(result) = &call.result {
            collect_from_value(result, &mut seen, &mut out);
        }
    }

    // Channel 2: balanced-brace scrape of the output text.
    for candidate in json_candidates(&outcome.output) {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            collect_from_value(&value, &mut seen, &mut out);
        }
    }

    out
}

/// Recursively collect artifact-shaped objects from a JSON value.
fn collect_from_value(
    value: &Value,
    seen: &mut HashSet<(String, String)>,
    out: &mut Vec<ArtifactRef>,
) {
    match value {
        Value::Object(map) => {
            if let (Some(cid), Some(topic)) = (
                map.get("cid").and_then(Value::as_str),
                map.get("topic").and_then(Value::as_str),
            ) {
                let key = (cid.to_string(), topic.to_string());
                if seen.insert(key) {
                    out.push(ArtifactRef {
                        cid: cid.to_string(),
                        topic: topic.to_string(),
                        name: map.get("name").and_then(Value::as_str).map(String::from),
                        kind: map.get("type").and_then(Value::as_str).map(String::from),
                        tags: map
                            .get("tags")
                            .and_then(Value::as_array)
                            .map(|tags| {
                                tags.iter()
                                    .filter_map(Value::as_str)
                                    .map(String::from)
                                    .collect()
                            })
                            .unwrap_or_default(),
                    });
                }
            }
            for nested in map.values() {
                collect_from_value(nested, seen, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_from_value(item, seen, out);
            }
        }
        _ => {}
    }
}

/// Balanced-brace scan: yield each top-level `{…}` substring of `text`.
///
/// Tracks string literals and escapes so braces inside strings do not
/// unbalance the scan. Malformed tails are dropped silently.
fn json_candidates(text: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (index, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(index);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0
                    && let Some(begin) = start.take()
                {
                    candidates.push(text[begin..=index].to_string());
                }
            }
            _ => {}
        }
    }
    candidates
}
