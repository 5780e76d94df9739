// SPDX-License-Identifier: MIT OR Apache-2.0
//! Invariant providers.
//!
//! The prompt is assembled from a fixed, ordered list of providers, each a
//! pure function of the job context and the invariants accumulated so far.
//! Order matters: later providers read what earlier ones contributed.
//! Every emitted invariant is type-validated; failures aggregate into one
//! `INVALID_BLUEPRINT` fault naming each offending id.

use mech_context::JobContext;
use mech_core::{Fault, FaultKind, Invariant, InvariantScope, Stage};
use tracing::debug;

/// Mission-invariant count at which the strategy provider pushes the job
/// toward decomposition.
const DECOMPOSE_THRESHOLD: usize = 4;

/// Hard ceiling on loop-recovery attempts.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Per-provider enable switches. Plain booleans, resolved at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Strategy provider (decompose-and-delegate policy).
    pub strategy: bool,
    /// Loop-recovery provider.
    pub recovery: bool,
    /// Tooling provider (coding jobs).
    pub tooling: bool,
    /// Quality provider.
    pub quality: bool,
    /// Cycle provider.
    pub cycle: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            strategy: true,
            recovery: true,
            tooling: true,
            quality: true,
            cycle: true,
        }
    }
}

/// Invariants accumulated across the provider chain.
#[derive(Debug, Default)]
pub struct Accumulated {
    /// Everything emitted so far, in provider order.
    pub invariants: Vec<Invariant>,
}

impl Accumulated {
    /// Mission-scoped slice of the accumulation.
    #[must_use]
    pub fn mission_count(&self) -> usize {
        self.invariants
            .iter()
            .filter(|i| i.scope() == InvariantScope::Mission)
            .count()
    }
}

/// A single provider in the chain.
pub trait InvariantProvider: Send + Sync {
    /// Domain name, used in tracing and prompt sectioning.
    fn domain(&self) -> &'static str;

    /// Whether this provider runs for the given job.
    fn enabled(&self, config: &ProviderConfig, context: &JobContext) -> bool;

    /// Contribute invariants. Pure: no I/O, no mutation of the context.
    fn provide(&self, context: &JobContext, accumulated: &Accumulated) -> Vec<Invariant>;
}

fn boolean(id: &str, condition: impl Into<String>, assessment: impl Into<String>) -> Invariant {
    Invariant::Boolean {
        id: id.to_string(),
        condition: condition.into(),
        assessment: assessment.into(),
        examples: None,
    }
}

// ---------------------------------------------------------------------------
// Providers, in chain order
// ---------------------------------------------------------------------------

/// Baseline system directives every job receives.
struct SystemProvider;

impl InvariantProvider for SystemProvider {
    fn domain(&self) -> &'static str {
        "system"
    }

    fn enabled(&self, _: &ProviderConfig, _: &JobContext) -> bool {
        true
    }

    fn provide(&self, _context: &JobContext, _acc: &Accumulated) -> Vec<Invariant> {
        vec![
            boolean(
                "SYS-STATUS",
                "The final output states the job status explicitly when the mission \
                 could not be completed",
                "Scan the last output lines for an explicit status statement",
            ),
            boolean(
                "SYS-SCOPE",
                "Work stays within the tools and workspace provided; no side channels",
                "Confirm every side effect went through an enabled tool",
            ),
        ]
    }
}

/// Mission invariants straight from the job blueprint.
struct JobProvider;

impl InvariantProvider for JobProvider {
    fn domain(&self) -> &'static str {
        "job"
    }

    fn enabled(&self, _: &ProviderConfig, _: &JobContext) -> bool {
        true
    }

    fn provide(&self, context: &JobContext, _acc: &Accumulated) -> Vec<Invariant> {
        context.blueprint.invariants.clone()
    }
}

/// Prior-measurement awareness.
struct LearningProvider;

impl InvariantProvider for LearningProvider {
    fn domain(&self) -> &'static str {
        "learning"
    }

    fn enabled(&self, _: &ProviderConfig, context: &JobContext) -> bool {
        !context.measurements.is_empty()
    }

    fn provide(&self, context: &JobContext, _acc: &Accumulated) -> Vec<Invariant> {
        let failing: Vec<&str> = context
            .measurements
            .values()
            .filter(|m| !m.passed)
            .map(|m| m.invariant_id.as_str())
            .collect();
        let condition = if failing.is_empty() {
            format!(
                "Prior measurements ({} invariants) are reviewed before repeating work",
                context.measurements.len()
            )
        } else {
            format!(
                "Previously failing invariants are addressed first: {}",
                failing.join(", ")
            )
        };
        vec![boolean(
            "LEARN-PRIOR",
            condition,
            "Compare the new measurements against the folded history",
        )]
    }
}

/// Child-state coordination.
struct CoordinationProvider;

impl InvariantProvider for CoordinationProvider {
    fn domain(&self) -> &'static str {
        "coordination"
    }

    fn enabled(&self, _: &ProviderConfig, context: &JobContext) -> bool {
        context
            .hierarchy
            .children(&context.metadata.job_definition_id)
            .next()
            .is_some()
    }

    fn provide(&self, context: &JobContext, _acc: &Accumulated) -> Vec<Invariant> {
        let pending = context
            .hierarchy
            .has_pending_children(&context.metadata.job_definition_id);
        let condition = if pending {
            "Child jobs are still running; their states are checked before this job \
             declares itself complete"
                .to_string()
        } else {
            "Completed child results are folded into this job's output".to_string()
        };
        vec![boolean(
            "COORD-CHILDREN",
            condition,
            "List each child job and the state it was observed in",
        )]
    }
}

/// Workstream state propagation.
struct StateProvider;

impl InvariantProvider for StateProvider {
    fn domain(&self) -> &'static str {
        "state"
    }

    fn enabled(&self, _: &ProviderConfig, context: &JobContext) -> bool {
        context.workstream_id().is_some()
    }

    fn provide(&self, context: &JobContext, _acc: &Accumulated) -> Vec<Invariant> {
        let workstream = context.workstream_id().unwrap_or_default();
        vec![boolean(
            "STATE-PERSIST",
            format!(
                "Durable results are published as artifacts in workstream {workstream}, \
                 not kept only in output text"
            ),
            "Check the tool-call trace for artifact publications",
        )]
    }
}

/// Decompose-and-delegate policy.
struct StrategyProvider;

impl InvariantProvider for StrategyProvider {
    fn domain(&self) -> &'static str {
        "strategy"
    }

    fn enabled(&self, config: &ProviderConfig, _: &JobContext) -> bool {
        config.strategy
    }

    fn provide(&self, context: &JobContext, accumulated: &Accumulated) -> Vec<Invariant> {
        // Wide missions with no delivered children should be split rather
        // than attempted in one run.
        if accumulated.mission_count() < DECOMPOSE_THRESHOLD || context.has_completed_children() {
            return vec![];
        }
        vec![Invariant::Boolean {
            id: "STRAT-DECOMPOSE".to_string(),
            condition: format!(
                "A mission of {} invariants with no completed children is decomposed: \
                 dispatch focused child jobs instead of attempting everything here",
                accumulated.mission_count()
            ),
            assessment: "Verify dispatch_new_job calls exist for distinct sub-missions"
                .to_string(),
            examples: Some(vec![
                "Do: dispatch one child per measurable objective, then deliver DELEGATING"
                    .to_string(),
                "Do: give each child a blueprint with 1-2 invariants and a clear name"
                    .to_string(),
                "Don't: attempt four or more unrelated objectives in a single run"
                    .to_string(),
                "Don't: dispatch children and also do their work yourself".to_string(),
            ]),
        }]
    }
}

/// Loop-protection recovery.
struct RecoveryProvider;

impl InvariantProvider for RecoveryProvider {
    fn domain(&self) -> &'static str {
        "recovery"
    }

    fn enabled(&self, config: &ProviderConfig, context: &JobContext) -> bool {
        config.recovery && context.metadata.loop_recovery().is_some()
    }

    fn provide(&self, context: &JobContext, _acc: &Accumulated) -> Vec<Invariant> {
        let Some(recovery) = context.metadata.loop_recovery() else {
            return vec![];
        };
        vec![boolean(
            "RECOV-LOOP",
            format!(
                "The previous run was loop-terminated (\"{}\"); this attempt ({} of {}) \
                 takes a different approach instead of repeating it",
                recovery.loop_message, recovery.attempt, MAX_RECOVERY_ATTEMPTS
            ),
            "Compare this run's actions against the terminated loop's pattern",
        )]
    }
}

/// Coding-job tooling discipline.
struct ToolingProvider;

impl InvariantProvider for ToolingProvider {
    fn domain(&self) -> &'static str {
        "tooling"
    }

    fn enabled(&self, config: &ProviderConfig, context: &JobContext) -> bool {
        config.tooling && context.is_coding_job()
    }

    fn provide(&self, _context: &JobContext, _acc: &Accumulated) -> Vec<Invariant> {
        vec![boolean(
            "TOOL-REPO",
            "Repository changes stay on the job branch and leave the tree committable",
            "Run a status check at the end of the run",
        )]
    }
}

/// Output quality floor.
struct QualityProvider;

impl InvariantProvider for QualityProvider {
    fn domain(&self) -> &'static str {
        "quality"
    }

    fn enabled(&self, config: &ProviderConfig, _: &JobContext) -> bool {
        config.quality
    }

    fn provide(&self, _context: &JobContext, _acc: &Accumulated) -> Vec<Invariant> {
        vec![boolean(
            "QUAL-EVIDENCE",
            "Every claimed result is backed by an artifact, a tool result, or a \
             measurement",
            "Cross-check claims in the output against the telemetry trace",
        )]
    }
}

/// Output schema conformance (mission-scoped: it is measured).
struct OutputProvider;

impl InvariantProvider for OutputProvider {
    fn domain(&self) -> &'static str {
        "output"
    }

    fn enabled(&self, _: &ProviderConfig, context: &JobContext) -> bool {
        context.metadata.output_schema.is_some()
    }

    fn provide(&self, _context: &JobContext, _acc: &Accumulated) -> Vec<Invariant> {
        vec![boolean(
            "OUT-SCHEMA",
            "The structured summary conforms to the job's output schema",
            "Validate the structured summary against the schema",
        )]
    }
}

/// Cycle-run framing.
struct CycleProvider;

impl InvariantProvider for CycleProvider {
    fn domain(&self) -> &'static str {
        "cycle"
    }

    fn enabled(&self, config: &ProviderConfig, context: &JobContext) -> bool {
        config.cycle && context.metadata.cycle().is_some()
    }

    fn provide(&self, context: &JobContext, _acc: &Accumulated) -> Vec<Invariant> {
        let Some(cycle) = context.metadata.cycle() else {
            return vec![];
        };
        vec![boolean(
            "CYCLE-PROGRESS",
            format!(
                "Cycle run {} builds on prior cycles' artifacts rather than starting over",
                cycle.cycle_number
            ),
            "Diff this cycle's output against the previous cycle's artifacts",
        )]
    }
}

/// The fixed provider chain, in dependency order.
#[must_use]
pub fn default_providers() -> Vec<Box<dyn InvariantProvider>> {
    vec![
        Box::new(SystemProvider),
        Box::new(JobProvider),
        Box::new(LearningProvider),
        Box::new(CoordinationProvider),
        Box::new(StateProvider),
        Box::new(StrategyProvider),
        Box::new(RecoveryProvider),
        Box::new(ToolingProvider),
        Box::new(QualityProvider),
        Box::new(OutputProvider),
        Box::new(CycleProvider),
    ]
}

/// The composed invariant set for one job.
#[derive(Debug, Default)]
pub struct ComposedInvariants {
    /// Every invariant, in provider order, tagged with its domain.
    pub sections: Vec<(&'static str, Vec<Invariant>)>,
}

impl ComposedInvariants {
    /// All invariants, flattened in provider order.
    pub fn all(&self) -> impl Iterator<Item = &Invariant> {
        self.sections.iter().flat_map(|(_, invs)| invs.iter())
    }

    /// The agent's measurement set: mission-scoped invariants.
    #[must_use]
    pub fn mission_set(&self) -> Vec<&Invariant> {
        self.all()
            .filter(|i| i.scope() == InvariantScope::Mission)
            .collect()
    }
}

/// Run the provider chain and validate everything it emitted.
pub fn compose(context: &JobContext, config: &ProviderConfig) -> Result<ComposedInvariants, Fault> {
    let mut accumulated = Accumulated::default();
    let mut composed = ComposedInvariants::default();
    let mut errors = Vec::new();

    for provider in default_providers() {
        if !provider.enabled(config, context) {
            debug!(target: "mech.pipeline", domain = provider.domain(), "provider skipped");
            continue;
        }
        let emitted = provider.provide(context, &accumulated);
        if emitted.is_empty() {
            continue;
        }
        for invariant in &emitted {
            if let Err(err) = invariant.validate() {
                errors.push(err);
            }
        }
        accumulated.invariants.extend(emitted.iter().cloned());
        composed.sections.push((provider.domain(), emitted));
    }

    if !errors.is_empty() {
        let detail = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(
            Fault::new(FaultKind::InvalidBlueprint, Stage::Prompt, detail)
                .with_request(context.request.id),
        );
    }
    Ok(composed)
}
