// SPDX-License-Identifier: MIT OR Apache-2.0
//! Blueprint parsing and the four-variant invariant model.
//!
//! A blueprint arrives as a JSON string inside job metadata. Its `invariants`
//! array holds tagged variants (`FLOOR` / `CEILING` / `RANGE` / `BOOLEAN`);
//! each is type-validated at ingestion and classified as a mission or system
//! invariant by its id prefix.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed assertion with an identifier and an assessment recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Invariant {
    /// Measured value must be `>= min`.
    #[serde(rename = "FLOOR")]
    Floor {
        /// Namespaced identifier, e.g. `JOB-1`.
        id: String,
        /// What is being measured.
        metric: String,
        /// Inclusive lower bound.
        min: f64,
        /// How to assess the metric.
        assessment: String,
        /// Optional worked examples.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        examples: Option<Vec<String>>,
    },
    /// Measured value must be `<= max`.
    #[serde(rename = "CEILING")]
    Ceiling {
        /// Namespaced identifier.
        id: String,
        /// What is being measured.
        metric: String,
        /// Inclusive upper bound.
        max: f64,
        /// How to assess the metric.
        assessment: String,
        /// Optional worked examples.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        examples: Option<Vec<String>>,
    },
    /// Measured value must lie in `[min, max]`; `min < max` is required.
    #[serde(rename = "RANGE")]
    Range {
        /// Namespaced identifier.
        id: String,
        /// What is being measured.
        metric: String,
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
        /// How to assess the metric.
        assessment: String,
        /// Optional worked examples.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        examples: Option<Vec<String>>,
    },
    /// A condition that must hold.
    #[serde(rename = "BOOLEAN")]
    Boolean {
        /// Namespaced identifier.
        id: String,
        /// The condition text.
        condition: String,
        /// How to assess the condition.
        assessment: String,
        /// Optional worked examples.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        examples: Option<Vec<String>>,
    },
}

/// Discriminant of an [`Invariant`], used in measurements and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvariantKind {
    /// `FLOOR` variant.
    #[serde(rename = "FLOOR")]
    Floor,
    /// `CEILING` variant.
    #[serde(rename = "CEILING")]
    Ceiling,
    /// `RANGE` variant.
    #[serde(rename = "RANGE")]
    Range,
    /// `BOOLEAN` variant.
    #[serde(rename = "BOOLEAN")]
    Boolean,
}

impl fmt::Display for InvariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Floor => "FLOOR",
            Self::Ceiling => "CEILING",
            Self::Range => "RANGE",
            Self::Boolean => "BOOLEAN",
        };
        f.write_str(s)
    }
}

/// Whether an invariant is measured by the agent or is a directive only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantScope {
    /// Handed to the agent as part of the measurement set.
    Mission,
    /// Contributed by providers; directive only.
    System,
}

/// Id prefixes that mark an invariant as mission-scoped.
///
/// `STRAT` appears in both the mission and system namespaces; it is treated
/// as mission here so strategy invariants stay measurable.
const MISSION_PREFIXES: &[&str] = &["JOB", "GOAL", "OUT", "STRAT", "VENTURE", "MEAS"];

impl Invariant {
    /// The invariant's namespaced identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Floor { id, .. }
            | Self::Ceiling { id, .. }
            | Self::Range { id, .. }
            | Self::Boolean { id, .. } => id,
        }
    }

    /// The variant discriminant.
    #[must_use]
    pub fn kind(&self) -> InvariantKind {
        match self {
            Self::Floor { .. } => InvariantKind::Floor,
            Self::Ceiling { .. } => InvariantKind::Ceiling,
            Self::Range { .. } => InvariantKind::Range,
            Self::Boolean { .. } => InvariantKind::Boolean,
        }
    }

    /// The assessment recipe text.
    #[must_use]
    pub fn assessment(&self) -> &str {
        match self {
            Self::Floor { assessment, .. }
            | Self::Ceiling { assessment, .. }
            | Self::Range { assessment, .. }
            | Self::Boolean { assessment, .. } => assessment,
        }
    }

    /// Mission/system classification from the id's prefix namespace.
    #[must_use]
    pub fn scope(&self) -> InvariantScope {
        let prefix = self.id().split('-').next().unwrap_or_default();
        if MISSION_PREFIXES.contains(&prefix) {
            InvariantScope::Mission
        } else {
            InvariantScope::System
        }
    }

    /// Type-validate this invariant.
    ///
    /// Checks non-empty id and assessment, non-empty metric/condition, and
    /// `min < max` for `RANGE`.
    pub fn validate(&self) -> Result<(), InvariantError> {
        let id = self.id();
        if id.trim().is_empty() {
            return Err(InvariantError::EmptyField {
                id: id.to_string(),
                field: "id",
            });
        }
        if self.assessment().trim().is_empty() {
            return Err(InvariantError::EmptyField {
                id: id.to_string(),
                field: "assessment",
            });
        }
        match self {
            Self::Floor { metric, .. } | Self::Ceiling { metric, .. } => {
                if metric.trim().is_empty() {
                    return Err(InvariantError::EmptyField {
                        id: id.to_string(),
                        field: "metric",
                    });
                }
            }
            Self::Range { metric, min, max, .. } => {
                if metric.trim().is_empty() {
                    return Err(InvariantError::EmptyField {
                        id: id.to_string(),
                        field: "metric",
                    });
                }
                if min >= max {
                    return Err(InvariantError::EmptyRange {
                        id: id.to_string(),
                        min: *min,
                        max: *max,
                    });
                }
            }
            Self::Boolean { condition, .. } => {
                if condition.trim().is_empty() {
                    return Err(InvariantError::EmptyField {
                        id: id.to_string(),
                        field: "condition",
                    });
                }
            }
        }
        Ok(())
    }
}

/// A single invariant's validation failure, carrying the offending id.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvariantError {
    /// A required text field is empty.
    #[error("invariant {id}: empty {field}")]
    EmptyField {
        /// Offending invariant id.
        id: String,
        /// Name of the empty field.
        field: &'static str,
    },
    /// A `RANGE` whose bounds do not describe a non-empty interval.
    #[error("invariant {id}: RANGE requires min < max (got min={min}, max={max})")]
    EmptyRange {
        /// Offending invariant id.
        id: String,
        /// Declared lower bound.
        min: f64,
        /// Declared upper bound.
        max: f64,
    },
}

/// Blueprint-level parse/validation failure.
#[derive(Debug, thiserror::Error)]
pub enum BlueprintError {
    /// The blueprint string is not valid JSON.
    #[error("blueprint is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The `invariants` array is missing.
    #[error("blueprint has no invariants array")]
    MissingInvariants,
    /// One or more invariants failed type validation.
    #[error("blueprint validation failed: {}", format_errors(.0))]
    Invalid(Vec<InvariantError>),
}

fn format_errors(errors: &[InvariantError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Wire shape of the blueprint JSON string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawBlueprint {
    #[serde(default)]
    invariants: Option<Vec<Invariant>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    narrative: Option<String>,
}

/// A parsed, validated job blueprint.
#[derive(Debug, Clone, PartialEq)]
pub struct Blueprint {
    /// Validated invariants, in declaration order.
    pub invariants: Vec<Invariant>,
    /// Free-form guidance attached to the blueprint, if any.
    pub narrative: Option<String>,
}

impl Blueprint {
    /// Parse and validate a blueprint from its JSON string form.
    ///
    /// All invariant failures are aggregated; the error lists every
    /// offending id rather than stopping at the first.
    pub fn parse(raw: &str) -> Result<Self, BlueprintError> {
        let raw: RawBlueprint = serde_json::from_str(raw)?;
        let invariants = raw.invariants.ok_or(BlueprintError::MissingInvariants)?;

        let errors: Vec<InvariantError> = invariants
            .iter()
            .filter_map(|inv| inv.validate().err())
            .collect();
        if !errors.is_empty() {
            return Err(BlueprintError::Invalid(errors));
        }

        Ok(Self {
            invariants,
            narrative: raw.narrative,
        })
    }

    /// Mission-scoped invariants (the agent's measurement set).
    #[must_use]
    pub fn mission_invariants(&self) -> Vec<&Invariant> {
        self.invariants
            .iter()
            .filter(|inv| inv.scope() == InvariantScope::Mission)
            .collect()
    }
}
