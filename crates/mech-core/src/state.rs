// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-request pipeline state machine.

use serde::{Deserialize, Serialize};

/// States a claimed request moves through inside one worker process.
///
/// The machine is linear per request; `Waiting` loops back through the
/// claim queue, and `Delivered` / `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// The on-chain claim succeeded; the worker holds the lease.
    Claimed,
    /// Metadata resolved and the job context was composed.
    ContextBuilt,
    /// Invariant providers ran and the prompt was assembled.
    PromptBuilt,
    /// The agent subprocess is running.
    Executing,
    /// Dependencies were found unsatisfied; the request was re-queued.
    Waiting,
    /// The reflection pass is running.
    Reflecting,
    /// Artifacts were extracted and persisted.
    ArtifactsExtracted,
    /// Delivery settled on chain. Terminal.
    Delivered,
    /// The request terminated with a fault. Terminal.
    Failed,
}

impl PipelineState {
    /// `true` for terminal states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// The set of states that may follow `self`.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [PipelineState] {
        match self {
            Self::Claimed => &[Self::ContextBuilt, Self::Waiting, Self::Failed],
            Self::ContextBuilt => &[Self::PromptBuilt, Self::Waiting, Self::Failed],
            Self::PromptBuilt => &[Self::Executing, Self::Failed],
            Self::Executing => &[Self::Reflecting, Self::ArtifactsExtracted, Self::Failed],
            Self::Waiting => &[Self::Claimed],
            Self::Reflecting => &[Self::ArtifactsExtracted, Self::Failed],
            Self::ArtifactsExtracted => &[Self::Delivered, Self::Failed],
            Self::Delivered | Self::Failed => &[],
        }
    }

    /// `true` when moving from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        self.valid_transitions().contains(&next)
    }
}
