// SPDX-License-Identifier: MIT OR Apache-2.0
//! Invariant measurements emitted by agents.

use crate::blueprint::InvariantKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An observation for a single invariant id.
///
/// Content-addressed and immutable once published; when folding into a job
/// context, only the newest measurement per invariant id wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    /// The invariant this measurement targets.
    pub invariant_id: String,
    /// Declared type of the invariant at measurement time.
    pub invariant_type: InvariantKind,
    /// Measured value; a number for FLOOR/CEILING/RANGE, a boolean for BOOLEAN.
    pub value: serde_json::Value,
    /// Whether the invariant held.
    pub passed: bool,
    /// Free-form context from the measuring agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// When the measurement was taken.
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    /// `true` when `other` observes the same invariant at a later time.
    #[must_use]
    pub fn superseded_by(&self, other: &Measurement) -> bool {
        self.invariant_id == other.invariant_id && other.timestamp > self.timestamp
    }
}
