// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The shared data model for the mech worker: requests, job metadata,
//! blueprint invariants, measurements, execution results, delivery payloads,
//! and the worker-wide fault taxonomy.
//!
//! Every other crate in the workspace depends on this one; it depends on
//! nothing but serde and the chain primitive types.

/// Blueprint parsing and the four-variant invariant model.
pub mod blueprint;
/// Delivery payload and terminal status model.
pub mod delivery;
/// Fault taxonomy shared by every pipeline stage.
pub mod error;
/// Agent execution results and tool-call telemetry.
pub mod execution;
/// Parent/child job hierarchy nodes.
pub mod hierarchy;
/// Invariant measurements emitted by agents.
pub mod measurement;
/// Content-addressed job metadata.
pub mod metadata;
/// On-chain request model.
pub mod request;
/// Per-request pipeline state machine.
pub mod state;

pub use blueprint::{Blueprint, Invariant, InvariantKind, InvariantScope};
pub use delivery::{DeliveryPayload, DeliveryStatus};
pub use error::{Fault, FaultKind, Stage};
pub use execution::{AgentTelemetry, ArtifactRef, ExecutionResult, ToolCall};
pub use hierarchy::{HierarchyNode, JobHierarchy, NodeStatus};
pub use measurement::Measurement;
pub use metadata::{AdditionalContext, CodeMetadata, CycleInfo, JobMetadata, Lineage, LoopRecovery, ToolPolicy};
pub use request::{Request, RequestId};
pub use state::PipelineState;
