// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-pipeline
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The per-request execution pipeline: context build, invariant-provider
//! prompt assembly, agent invocation, the coding sub-pipeline, artifact
//! extraction, reflection, and status inference. The pipeline never
//! panics a request: every fault becomes a FAILED delivery payload, and
//! unsatisfied dependencies re-queue instead of delivering.

/// Artifact extraction from tool calls and output text.
pub mod artifacts;
/// Git sub-pipeline for coding jobs.
pub mod coding;
/// Invariant providers and composition.
pub mod providers;
/// Prompt rendering.
pub mod prompt;
/// Reflection pass.
pub mod reflect;
/// Status inference.
pub mod status;

use mech_agent::{AgentOutcome, AgentSpec};
use mech_config::{AgentConfig, GitConfig};
use mech_context::{ContextBuilder, JobContext};
use mech_core::{
    AgentTelemetry, DeliveryPayload, DeliveryStatus, Fault, FaultKind, Request, Stage,
};
use mech_indexer::IndexerClient;
use mech_store::ContentStore;
use providers::ProviderConfig;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What the daemon should do with a finished run.
#[derive(Debug)]
pub enum PipelineVerdict {
    /// Write this payload to the store and settle on chain.
    Deliver(DeliveryPayload),
    /// Dependencies unsatisfied: put the request back in the queue.
    Requeue {
        /// Why the request went back.
        reason: String,
    },
}

/// A finished pipeline run, ready for delivery and lineage bookkeeping.
#[derive(Debug)]
pub struct PipelineRun {
    /// The request that ran.
    pub request: Request,
    /// The built context, absent when context build itself failed.
    pub context: Option<JobContext>,
    /// Delivery or re-queue.
    pub verdict: PipelineVerdict,
    /// The fault that terminated the run, when one did.
    pub fault_kind: Option<FaultKind>,
    /// Loop-protection message, for recovery re-dispatch.
    pub loop_message: Option<String>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

/// The execution pipeline and its process-wide collaborators.
pub struct Pipeline {
    store: Arc<ContentStore>,
    indexer: IndexerClient,
    tool_registry: HashSet<String>,
    agent: AgentConfig,
    git: GitConfig,
    agent_env: BTreeMap<String, String>,
    providers: ProviderConfig,
    // One in-flight coding job per workspace repository.
    repo_lock: tokio::sync::Mutex<()>,
}

impl Pipeline {
    /// Wire a pipeline over the process-wide store and indexer.
    pub fn new(
        store: Arc<ContentStore>,
        indexer: IndexerClient,
        tool_registry: HashSet<String>,
        agent: AgentConfig,
        git: GitConfig,
        agent_env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            store,
            indexer,
            tool_registry,
            agent,
            git,
            agent_env,
            providers: ProviderConfig::default(),
            repo_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Override provider switches.
    #[must_use]
    pub fn with_providers(mut self, providers: ProviderConfig) -> Self {
        self.providers = providers;
        self
    }

    /// Run one claimed request to a verdict. Never returns an error: all
    /// faults terminate in a FAILED payload.
    pub async fn execute(&self, request: &Request) -> PipelineRun {
        let started = Instant::now();
        info!(target: "mech.pipeline", request = %request.id, "pipeline start");

        let builder = ContextBuilder::new(&self.store, &self.indexer, &self.tool_registry);
        let context = match builder.build(request).await {
            Ok(context) => context,
            Err(fault) => return self.failed(request, None, fault, None, started),
        };

        // Metadata-level dependency gate; the claim loop checked the
        // request-level list, but metadata may carry more.
        if let Some(pending) = self.pending_dependencies(&context).await {
            info!(target: "mech.pipeline", request = %request.id, %pending, "dependencies unsatisfied; requeue");
            return PipelineRun {
                request: request.clone(),
                context: Some(context),
                verdict: PipelineVerdict::Requeue {
                    reason: format!("undelivered dependencies: {pending}"),
                },
                fault_kind: None,
                loop_message: None,
                duration: started.elapsed(),
            };
        }

        let composed = match providers::compose(&context, &self.providers) {
            Ok(composed) => composed,
            Err(fault) => return self.failed(request, Some(context), fault, None, started),
        };
        let prompt_text = prompt::render(&context, &composed);

        // Coding jobs hold the repo lock from prepare through finalize.
        let mut repo_guard = None;
        let coding_job = if context.is_coding_job() {
            repo_guard = Some(self.repo_lock.lock().await);
            match coding::prepare(&context, &self.git).await {
                Ok(job) => job,
                Err(fault) => return self.failed(request, Some(context), fault, None, started),
            }
        } else {
            None
        };

        let spec = self.agent_spec(&context, coding_job.as_ref());
        let outcome = match mech_agent::run(&spec, &prompt_text).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let fault = Fault::new(FaultKind::Unknown, Stage::Execute, err.to_string())
                    .with_request(request.id);
                return self.failed(request, Some(context), fault, None, started);
            }
        };

        if outcome.timed_out() {
            let fault = Fault::new(
                FaultKind::AgentTimeout,
                Stage::Execute,
                format!("agent exceeded {}s", self.agent.timeout_secs),
            )
            .with_request(request.id);
            return self.failed(request, Some(context), fault, Some(&outcome), started);
        }

        if let Some(loop_message) = outcome.telemetry.loop_message.clone() {
            let fault = Fault::new(FaultKind::LoopTerminated, Stage::Execute, loop_message)
                .with_request(request.id);
            return self.failed(request, Some(context), fault, Some(&outcome), started);
        }

        let mut pr_url = None;
        if let Some(job) = &coding_job {
            match coding::finalize(&context, job, &summary_text(&outcome)).await {
                Ok(result) => pr_url = result.pr_url,
                Err(fault) => {
                    return self.failed(request, Some(context), fault, Some(&outcome), started);
                }
            }
        }
        drop(repo_guard);

        let extracted = artifacts::extract(&outcome);
        self.persist_artifacts(&context, &extracted).await;

        let inferred = {
            let children_pending = self.children_pending(&context).await;
            status::infer(&outcome, children_pending)
        };

        if self.agent.reflection {
            self.reflect(&context, &inferred, &outcome).await;
        }

        let payload = DeliveryPayload {
            status: inferred.status,
            message: inferred.message,
            output: outcome.output.clone(),
            model: self.model_for(&context),
            telemetry: outcome.telemetry.clone(),
            artifacts: extracted,
            pr_url,
        };

        info!(
            target: "mech.pipeline",
            request = %request.id,
            status = %payload.status,
            duration_ms = started.elapsed().as_millis() as u64,
            "pipeline finished"
        );
        PipelineRun {
            request: request.clone(),
            context: Some(context),
            verdict: PipelineVerdict::Deliver(payload),
            fault_kind: None,
            loop_message: None,
            duration: started.elapsed(),
        }
    }

    /// Undelivered metadata dependencies, rendered for the requeue reason.
    async fn pending_dependencies(&self, context: &JobContext) -> Option<String> {
        let deps = context.metadata.dependencies.as_ref()?;
        if deps.is_empty() {
            return None;
        }
        match self.indexer.requests_by_ids(deps).await {
            Ok(records) => {
                let delivered: HashSet<_> = records
                    .iter()
                    .filter(|r| r.request.delivered)
                    .map(|r| r.request.id)
                    .collect();
                let pending: Vec<String> = deps
                    .iter()
                    .filter(|d| !delivered.contains(d))
                    .map(ToString::to_string)
                    .collect();
                (!pending.is_empty()).then(|| pending.join(", "))
            }
            Err(err) => {
                // The claim loop vetted the request-level list; stay
                // permissive when the indexer blinks mid-run.
                warn!(target: "mech.pipeline", error = %err, "dependency check unreachable");
                None
            }
        }
    }

    /// Post-execution child view: any child with no delivered run yet.
    async fn children_pending(&self, context: &JobContext) -> bool {
        let definition_id = &context.metadata.job_definition_id;
        let children = match self.indexer.child_definitions(definition_id).await {
            Ok(children) => children,
            Err(err) => {
                warn!(target: "mech.pipeline", error = %err, "child query failed; using hierarchy snapshot");
                return context.hierarchy.has_pending_children(definition_id);
            }
        };
        for child in children {
            match self.indexer.requests_for_definition(&child.id).await {
                Ok(runs) if runs.iter().any(|r| !r.request.delivered) => return true,
                Ok(runs) if runs.is_empty() => return true,
                Ok(_) => {}
                Err(_) => return true,
            }
        }
        false
    }

    async fn persist_artifacts(&self, context: &JobContext, extracted: &[mech_core::ArtifactRef]) {
        for artifact in extracted {
            if let Err(err) = self
                .indexer
                .create_artifact(
                    artifact,
                    context.workstream_id(),
                    Some(&context.metadata.job_definition_id),
                )
                .await
            {
                warn!(target: "mech.pipeline", cid = %artifact.cid, error = %err, "artifact persistence failed");
            }
        }
    }

    async fn reflect(
        &self,
        context: &JobContext,
        inferred: &status::InferredStatus,
        outcome: &AgentOutcome,
    ) {
        let prompt_text = reflect::render_prompt(context, inferred, outcome);
        let mut spec = self.agent_spec(context, None);
        spec.env.insert(
            mech_agent::ENV_AVAILABLE_TOOLS.to_string(),
            serde_json::json!([reflect::REFLECTION_TOOL]).to_string(),
        );
        spec.env
            .insert(mech_agent::ENV_REQUIRED_TOOLS.to_string(), "[]".to_string());

        match mech_agent::run(&spec, &prompt_text).await {
            Ok(reflection) => {
                let memories = artifacts::extract(&reflection);
                self.persist_artifacts(context, &memories).await;
            }
            Err(err) => {
                warn!(target: "mech.pipeline", error = %err, "reflection run failed (non-fatal)");
            }
        }
    }

    fn model_for(&self, context: &JobContext) -> Option<String> {
        context
            .metadata
            .model
            .clone()
            .or_else(|| self.agent.default_model.clone())
    }

    fn agent_spec(&self, context: &JobContext, coding: Option<&coding::CodingJob>) -> AgentSpec {
        let mut env = self.agent_env.clone();
        env.extend(context.env.clone());

        env.insert(
            mech_agent::ENV_REQUEST_ID.to_string(),
            context.request.id.to_string(),
        );
        env.insert(
            mech_agent::ENV_JOB_DEFINITION_ID.to_string(),
            context.metadata.job_definition_id.clone(),
        );
        env.insert(
            mech_agent::ENV_JOB_NAME.to_string(),
            context.metadata.job_name.clone(),
        );
        if let Some(workstream) = context.workstream_id() {
            env.insert(mech_agent::ENV_WORKSTREAM_ID.to_string(), workstream.to_string());
        }
        env.insert(
            mech_agent::ENV_MECH_ADDRESS.to_string(),
            context.request.mech.to_string(),
        );
        if let Some(code) = &context.metadata.code_metadata {
            if let Some(base) = &code.base_branch {
                env.insert(mech_agent::ENV_BASE_BRANCH.to_string(), base.clone());
            }
        }
        if let Some(job) = coding {
            env.insert(mech_agent::ENV_BRANCH_NAME.to_string(), job.branch.clone());
        }
        env.insert(
            mech_agent::ENV_REQUIRED_TOOLS.to_string(),
            serde_json::json!(context.required_tools).to_string(),
        );
        env.insert(
            mech_agent::ENV_AVAILABLE_TOOLS.to_string(),
            serde_json::json!(context.available_tools).to_string(),
        );
        env.insert(
            mech_agent::ENV_ALLOWED_MODELS.to_string(),
            serde_json::json!(self.agent.allowed_models).to_string(),
        );
        if let Some(model) = self.model_for(context) {
            env.insert(mech_agent::ENV_DEFAULT_MODEL.to_string(), model);
        }

        AgentSpec {
            command: self.agent.command.clone(),
            args: self.agent.args.clone(),
            env,
            cwd: coding.map(|job| job.repo.dir().to_path_buf()),
            timeout: Duration::from_secs(self.agent.timeout_secs),
        }
    }

    /// Terminate a run in FAILED, preserving whatever the agent captured.
    fn failed(
        &self,
        request: &Request,
        context: Option<JobContext>,
        fault: Fault,
        outcome: Option<&AgentOutcome>,
        started: Instant,
    ) -> PipelineRun {
        warn!(target: "mech.pipeline", request = %request.id, %fault, "pipeline failed");
        let loop_message = match fault.kind {
            FaultKind::LoopTerminated => Some(fault.message.clone()),
            _ => outcome.and_then(|o| o.telemetry.loop_message.clone()),
        };
        let payload = DeliveryPayload {
            status: DeliveryStatus::Failed,
            message: fault.delivery_message(),
            output: outcome.map(|o| o.output.clone()).unwrap_or_default(),
            model: context.as_ref().and_then(|c| self.model_for(c)),
            telemetry: outcome
                .map(|o| o.telemetry.clone())
                .unwrap_or_else(AgentTelemetry::default),
            artifacts: outcome.map(artifacts::extract).unwrap_or_default(),
            pr_url: None,
        };
        PipelineRun {
            request: request.clone(),
            context,
            verdict: PipelineVerdict::Deliver(payload),
            fault_kind: Some(fault.kind),
            loop_message,
            duration: started.elapsed(),
        }
    }
}

fn summary_text(outcome: &AgentOutcome) -> String {
    outcome
        .structured_summary
        .as_ref()
        .and_then(|summary| {
            summary
                .get("summary")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| outcome.output.clone())
}

#[cfg(test)]
pub(crate) mod testutil;
