// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fault taxonomy shared by every pipeline stage.
//!
//! Faults are tagged values, never string blobs. Each pipeline stage catches
//! only its own expected failure kinds, translates them into a [`Fault`]
//! with structured context, and lets anything unexpected bubble to the
//! request boundary where it becomes [`FaultKind::Unknown`].

use crate::request::RequestId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stage a fault was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Claim loop eligibility and lease acquisition.
    Claim,
    /// Metadata fetch and job-context composition.
    Context,
    /// Invariant providers and prompt assembly.
    Prompt,
    /// Agent subprocess execution.
    Execute,
    /// Reflection pass.
    Reflect,
    /// Artifact extraction and persistence.
    Artifacts,
    /// Git sub-pipeline.
    Git,
    /// Payload publish and on-chain settlement.
    Delivery,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Claim => "claim",
            Self::Context => "context",
            Self::Prompt => "prompt",
            Self::Execute => "execute",
            Self::Reflect => "reflect",
            Self::Artifacts => "artifacts",
            Self::Git => "git",
            Self::Delivery => "delivery",
        };
        f.write_str(s)
    }
}

/// Every fault kind the worker distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultKind {
    // ── Transient (retry with backoff) ─────────────────────────────────
    /// RPC transport or node failure.
    RpcFailure,

    // ── Terminal request-level ─────────────────────────────────────────
    /// Metadata blob unreadable, invalid JSON, or blueprint absent.
    MalformedMetadata,
    /// One or more blueprint invariants failed type validation.
    InvalidBlueprint,
    /// A required tool is missing from the worker's registry.
    ToolUnavailable,
    /// The agent run exceeded its wall-clock timeout.
    AgentTimeout,
    /// Loop protection terminated the agent.
    LoopTerminated,
    /// A Safe transaction reverted on chain.
    SafeTxRevert,
    /// Pre-flight simulation reverted before gas was spent.
    SimRevert,
    /// Operator account cannot fund the transaction.
    InsufficientFunds,
    /// A clone URL failed the remote allowlist.
    UnsafeCloneUrl,
    /// Push rejected and the rebase recovery failed.
    NonFastForward,

    // ── Catch-all ──────────────────────────────────────────────────────
    /// An unexpected error bubbled to the request boundary.
    Unknown,
}

impl FaultKind {
    /// The wire code, as written into delivery payload messages.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::RpcFailure => "RPC_FAILURE",
            Self::MalformedMetadata => "MALFORMED_METADATA",
            Self::InvalidBlueprint => "INVALID_BLUEPRINT",
            Self::ToolUnavailable => "TOOL_UNAVAILABLE",
            Self::AgentTimeout => "AGENT_TIMEOUT",
            Self::LoopTerminated => "LOOP_TERMINATED",
            Self::SafeTxRevert => "SAFE_TX_REVERT",
            Self::SimRevert => "SIM_REVERT",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::UnsafeCloneUrl => "UNSAFE_CLONE_URL",
            Self::NonFastForward => "NON_FAST_FORWARD",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// `true` when a retry with backoff is warranted.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RpcFailure)
    }

    /// `true` when the request should settle as FAILED.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_transient()
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A fault with structured context.
#[derive(Debug, thiserror::Error)]
#[error("{kind} at {stage} stage{}: {message}", request_suffix(.request_id))]
pub struct Fault {
    /// What went wrong.
    pub kind: FaultKind,
    /// Which stage raised it.
    pub stage: Stage,
    /// The request being processed, when known.
    pub request_id: Option<RequestId>,
    /// Human-readable detail.
    pub message: String,
    /// Underlying cause, when one exists.
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

fn request_suffix(request_id: &Option<RequestId>) -> String {
    match request_id {
        Some(id) => format!(" (request {id})"),
        None => String::new(),
    }
}

impl Fault {
    /// Build a fault with no underlying cause.
    pub fn new(kind: FaultKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            request_id: None,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the request id.
    #[must_use]
    pub fn with_request(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Wrap an unexpected error at the request boundary.
    pub fn unknown(stage: Stage, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            kind: FaultKind::Unknown,
            stage,
            request_id: None,
            message: cause.to_string(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Message written into the delivery payload for this fault.
    #[must_use]
    pub fn delivery_message(&self) -> String {
        format!("{}: {}", self.kind.code(), self.message)
    }
}
