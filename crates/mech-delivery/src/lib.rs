// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-delivery
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Turns a finished pipeline run into on-chain settlement: publish the
//! payload to the content store, submit `deliver` through the service
//! Safe with transient-error retries, emit the worker-telemetry artifact,
//! and do the lineage bookkeeping (parent verification, cycle runs, loop
//! recovery) by dispatching new marketplace requests.

/// Marketplace dispatch shared with the venture dispatcher.
pub mod dispatch;

use alloy_primitives::B256;
use dispatch::Dispatcher;
use mech_chain::ChainError;
use mech_context::JobContext;
use mech_core::{
    AdditionalContext, ArtifactRef, CycleInfo, Fault, FaultKind, JobMetadata, LoopRecovery,
    RequestId, Stage,
};
use mech_indexer::IndexerClient;
use mech_pipeline::{PipelineRun, PipelineVerdict};
use mech_retry::BackoffPolicy;
use mech_store::ContentStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Artifact type for the observability payload emitted per delivery.
pub const WORKER_TELEMETRY_KIND: &str = "WORKER_TELEMETRY";
/// Loop-recovery dispatches stop after this attempt.
pub const MAX_RECOVERY_DISPATCHES: u32 = 3;

/// What settlement concluded.
#[derive(Debug)]
pub enum SettleOutcome {
    /// The run asked for a requeue; nothing was written.
    Requeued {
        /// Why the pipeline requeued.
        reason: String,
    },
    /// The chain already shows this request delivered; no-op.
    AlreadyDelivered,
    /// Payload written and settled.
    Delivered {
        /// 32-byte digest stored on chain.
        digest_hex: String,
        /// Follow-up requests dispatched by lineage bookkeeping.
        dispatched: Vec<RequestId>,
    },
}

/// Delivery settlement and lineage.
pub struct DeliveryService {
    store: Arc<ContentStore>,
    indexer: IndexerClient,
    dispatcher: Dispatcher,
    policy: BackoffPolicy,
}

impl DeliveryService {
    /// Wire the service over the process-wide collaborators.
    pub fn new(store: Arc<ContentStore>, indexer: IndexerClient, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            indexer,
            dispatcher,
            policy: BackoffPolicy::chain(),
        }
    }

    /// Override the retry policy (tests).
    #[must_use]
    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Settle one finished run.
    ///
    /// `SAFE_TX_REVERT` is terminal: the request is marked failed locally
    /// and the fault propagates (the chain state is authoritative).
    /// Telemetry and lineage failures are logged, never fatal.
    pub async fn settle(&self, run: &PipelineRun) -> Result<SettleOutcome, Fault> {
        let payload = match &run.verdict {
            PipelineVerdict::Requeue { reason } => {
                return Ok(SettleOutcome::Requeued {
                    reason: reason.clone(),
                });
            }
            PipelineVerdict::Deliver(payload) => payload,
        };
        let request_id = run.request.id;

        // Deliver-once: the chain may already show settlement (re-entry
        // after a crash between submission and bookkeeping).
        if self.already_delivered(request_id).await {
            info!(target: "mech.delivery", request = %request_id, "already delivered; skipping");
            return Ok(SettleOutcome::AlreadyDelivered);
        }

        let (cid, digest_hex) = self
            .store
            .put_json(payload)
            .await
            .map_err(|e| delivery_fault(request_id, FaultKind::Unknown, e.to_string()))?;
        let digest: B256 = digest_hex
            .parse()
            .map_err(|_| delivery_fault(request_id, FaultKind::Unknown, "digest shape"))?;

        mech_retry::retry(
            &self.policy,
            "delivery.submit",
            ChainError::is_transient,
            || self.dispatcher.deliver(request_id, digest),
        )
        .await
        .map_err(|err| {
            delivery_fault(request_id, err.fault_kind(), err.to_string())
        })?;

        info!(target: "mech.delivery", request = %request_id, %cid, %digest_hex, "delivery settled");

        self.emit_telemetry(run, &digest_hex).await;
        let dispatched = self.lineage(run).await;

        Ok(SettleOutcome::Delivered {
            digest_hex,
            dispatched,
        })
    }

    async fn already_delivered(&self, request_id: RequestId) -> bool {
        match self.indexer.requests_by_ids(&[request_id]).await {
            Ok(records) => records.iter().any(|r| r.request.delivered),
            Err(err) => {
                warn!(target: "mech.delivery", error = %err, "delivered check unreachable; proceeding");
                false
            }
        }
    }

    /// Publish the WORKER_TELEMETRY artifact. Non-fatal.
    async fn emit_telemetry(&self, run: &PipelineRun, delivery_digest: &str) {
        let PipelineVerdict::Deliver(payload) = &run.verdict else {
            return;
        };
        let record = serde_json::json!({
            "requestId": run.request.id,
            "status": payload.status,
            "deliveryDigest": delivery_digest,
            "durationMs": run.duration.as_millis() as u64,
            "toolCalls": payload.telemetry.tool_calls,
            "artifactCount": payload.artifacts.len(),
        });
        let cid = match self.store.put_json(&record).await {
            Ok((cid, _)) => cid,
            Err(err) => {
                warn!(target: "mech.delivery", error = %err, "telemetry publish failed");
                return;
            }
        };
        let artifact = ArtifactRef {
            cid: cid.to_string(),
            topic: "worker-telemetry".to_string(),
            name: Some(format!("telemetry {}", run.request.id)),
            kind: Some(WORKER_TELEMETRY_KIND.to_string()),
            tags: vec![],
        };
        let (workstream, definition) = match &run.context {
            Some(context) => (
                context.workstream_id().map(String::from),
                Some(context.metadata.job_definition_id.clone()),
            ),
            None => (None, None),
        };
        if let Err(err) = self
            .indexer
            .create_artifact(&artifact, workstream.as_deref(), definition.as_deref())
            .await
        {
            warn!(target: "mech.delivery", error = %err, "telemetry artifact persistence failed");
        }
    }

    /// Parent verification, cycle, and loop-recovery dispatches.
    /// Failures are logged; the settled delivery stands.
    async fn lineage(&self, run: &PipelineRun) -> Vec<RequestId> {
        let Some(context) = &run.context else {
            return vec![];
        };
        let mut dispatched = Vec::new();

        // Loop recovery: re-dispatch the same job with the terminating
        // cause, up to the attempt ceiling.
        if run.fault_kind == Some(FaultKind::LoopTerminated)
            && let Some(loop_message) = &run.loop_message
        {
            let attempt = context
                .metadata
                .loop_recovery()
                .map(|r| r.attempt + 1)
                .unwrap_or(2);
            if attempt <= MAX_RECOVERY_DISPATCHES {
                let mut metadata = context.metadata.clone();
                let extra = metadata.additional_context.get_or_insert_with(AdditionalContext::default);
                extra.loop_recovery = Some(LoopRecovery {
                    attempt,
                    loop_message: loop_message.clone(),
                });
                self.try_dispatch(&metadata, "loop-recovery", &mut dispatched).await;
            } else {
                warn!(target: "mech.delivery", "loop recovery attempts exhausted");
            }
        }

        let delivered_ok = matches!(
            &run.verdict,
            PipelineVerdict::Deliver(payload) if payload.status == mech_core::DeliveryStatus::Completed
        );

        // Cycle: completed cyclic jobs re-dispatch themselves.
        if delivered_ok && context.metadata.cyclic == Some(true) {
            let cycle_number = context
                .metadata
                .cycle()
                .map(|c| c.cycle_number + 1)
                .unwrap_or(1);
            let mut metadata = context.metadata.clone();
            let extra = metadata.additional_context.get_or_insert_with(AdditionalContext::default);
            extra.cycle = Some(CycleInfo {
                is_cycle_run: true,
                cycle_number,
            });
            extra.loop_recovery = None;
            self.try_dispatch(&metadata, "cycle", &mut dispatched).await;
        }

        // Parent verification: when the last pending sibling settles, the
        // parent gets a verification run.
        if let Some(parent_id) = self.parent_definition(context).await
            && !self.siblings_pending(&parent_id, &context.metadata.job_definition_id).await
        {
            match self.verification_metadata(&parent_id).await {
                Some(metadata) => {
                    self.try_dispatch(&metadata, "parent-verification", &mut dispatched)
                        .await;
                }
                None => {
                    warn!(target: "mech.delivery", %parent_id, "parent metadata unavailable; verification skipped");
                }
            }
        }

        dispatched
    }

    async fn try_dispatch(
        &self,
        metadata: &JobMetadata,
        label: &str,
        dispatched: &mut Vec<RequestId>,
    ) {
        match self.dispatcher.dispatch(metadata).await {
            Ok(request_id) => {
                info!(target: "mech.delivery", %label, request = %request_id, "lineage dispatch");
                dispatched.push(request_id);
            }
            Err(err) => {
                warn!(target: "mech.delivery", %label, error = %err, "lineage dispatch failed");
            }
        }
    }

    /// Parent job definition of the settled job, when one exists.
    async fn parent_definition(&self, context: &JobContext) -> Option<String> {
        match self
            .indexer
            .job_definition(&context.metadata.job_definition_id)
            .await
        {
            Ok(Some(record)) => record.parent_job_definition_id,
            _ => None,
        }
    }

    /// Any sibling of `own_id` under `parent_id` without a delivered run.
    async fn siblings_pending(&self, parent_id: &str, own_id: &str) -> bool {
        let children = match self.indexer.child_definitions(parent_id).await {
            Ok(children) => children,
            Err(_) => return true,
        };
        for child in children {
            if child.id == own_id {
                continue; // the run being settled right now
            }
            match self.indexer.requests_for_definition(&child.id).await {
                Ok(runs) if runs.is_empty() => return true,
                Ok(runs) if runs.iter().any(|r| !r.request.delivered) => return true,
                Ok(_) => {}
                Err(_) => return true,
            }
        }
        false
    }

    /// Clone the parent's latest metadata and mark it verification-required.
    async fn verification_metadata(&self, parent_id: &str) -> Option<JobMetadata> {
        let runs = self
            .indexer
            .requests_for_definition(parent_id)
            .await
            .ok()?;
        let latest = runs.last()?;
        let digest_hex = format!("{}", latest.request.data);
        let bytes = self
            .store
            .get_by_digest(&digest_hex, Some(&latest.request.id))
            .await
            .ok()??;
        let mut metadata: JobMetadata = serde_json::from_slice(&bytes).ok()?;
        let extra = metadata
            .additional_context
            .get_or_insert_with(AdditionalContext::default);
        extra.verification_required = Some(true);
        extra.cycle = None;
        extra.loop_recovery = None;
        Some(metadata)
    }
}

fn delivery_fault(request_id: RequestId, kind: FaultKind, message: impl Into<String>) -> Fault {
    Fault::new(kind, Stage::Delivery, message).with_request(request_id)
}
