// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-claim
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The claim loop: a single cooperative ticker that polls the indexer for
//! unclaimed requests, filters them through the stake, credential, and
//! dependency gates, orders the survivors, and claims the head on chain.
//! A successful claim is a lease; the request is handed to the worker
//! queue at most once per process.

/// Credential broker client and tool → provider map.
pub mod credentials;
/// Cooperative shutdown signal.
pub mod shutdown;

use alloy_primitives::Address;
use async_trait::async_trait;
use credentials::ToolProviderMap;
use mech_chain::ChainError;
use mech_core::{Request, RequestId};
use mech_indexer::{IndexerClient, RequestRecord};
use mech_telemetry::WorkerMetrics;
use shutdown::ShutdownToken;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How many undelivered requests one tick considers.
const TICK_FETCH_LIMIT: u32 = 50;

/// On-chain claim submission; implemented over the chain gateway.
#[async_trait]
pub trait ClaimSubmitter: Send + Sync {
    /// Submit the claim transaction for `request_id`.
    async fn claim(&self, request_id: RequestId) -> Result<(), ChainError>;
}

/// View over the currently-staked operator set.
#[async_trait]
pub trait StakeView: Send + Sync {
    /// `true` when `address` belongs to a staked operator.
    async fn is_staked(&self, address: Address) -> bool;
}

/// Why a request was passed over this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    /// Already delivered on chain; claiming would be a wasted transaction.
    AlreadyDelivered,
    /// Already handed to the pipeline by this process.
    AlreadySeen,
    /// The requester is not staked.
    NotStaked,
    /// The worker lacks a required credential provider.
    MissingCredentials(String),
    /// A dependency has not delivered yet.
    PendingDependency(RequestId),
}

/// The claim loop.
pub struct ClaimLoop<C, S> {
    indexer: IndexerClient,
    submitter: C,
    stake: S,
    providers: HashSet<String>,
    provider_map: ToolProviderMap,
    mech: Address,
    trusted: bool,
    tick_interval: Duration,
    metrics: WorkerMetrics,
    seen: HashSet<RequestId>,
}

impl<C: ClaimSubmitter, S: StakeView> ClaimLoop<C, S> {
    /// Wire a loop for one mech.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        indexer: IndexerClient,
        submitter: C,
        stake: S,
        providers: HashSet<String>,
        provider_map: ToolProviderMap,
        mech: Address,
        trusted: bool,
        tick_interval: Duration,
        metrics: WorkerMetrics,
    ) -> Self {
        Self {
            indexer,
            submitter,
            stake,
            providers,
            provider_map,
            mech,
            trusted,
            tick_interval,
            metrics,
            seen: HashSet::new(),
        }
    }

    /// Run until shutdown. Each tick claims at most one request and hands
    /// it to `queue`; an in-flight claim always settles before exit.
    pub async fn run(mut self, queue: mpsc::Sender<Request>, shutdown: ShutdownToken) {
        info!(target: "mech.claim", mech = %self.mech, "claim loop started");
        loop {
            if shutdown.is_shutdown() {
                break;
            }
            let tick_started = Instant::now();
            match self.tick().await {
                Ok(Some(request)) => {
                    self.metrics.touch();
                    if queue.send(request).await.is_err() {
                        warn!(target: "mech.claim", "worker queue closed; stopping");
                        break;
                    }
                }
                Ok(None) => {
                    self.metrics.record_idle(tick_started.elapsed() + self.tick_interval);
                }
                Err(err) => {
                    warn!(target: "mech.claim", error = %err, "tick failed");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.tick_interval) => {}
                () = shutdown.signalled() => break,
            }
        }
        info!(target: "mech.claim", "claim loop stopped");
    }

    /// One tick: poll, gate, order, claim the head.
    pub async fn tick(&mut self) -> Result<Option<Request>, mech_indexer::IndexerError> {
        let records = self
            .indexer
            .undelivered_requests(self.mech, TICK_FETCH_LIMIT)
            .await?;

        let mut eligible: Vec<(bool, RequestRecord)> = Vec::new();
        for record in records {
            match self.evaluate(&record).await {
                Ok(needs_credentials) => eligible.push((needs_credentials, record)),
                Err(skip) => {
                    debug!(target: "mech.claim", request = %record.request.id, ?skip, "skipped");
                }
            }
        }

        // Credential-demanding jobs first on trusted workers, then age.
        eligible.sort_by(|(a_creds, a), (b_creds, b)| {
            let priority = if self.trusted {
                b_creds.cmp(a_creds)
            } else {
                std::cmp::Ordering::Equal
            };
            priority.then(a.request.block_timestamp.cmp(&b.request.block_timestamp))
        });

        let Some((_, head)) = eligible.into_iter().next() else {
            return Ok(None);
        };

        match self.submitter.claim(head.request.id).await {
            Ok(()) => {
                info!(target: "mech.claim", request = %head.request.id, "claimed");
                self.seen.insert(head.request.id);
                Ok(Some(head.request))
            }
            Err(err) => {
                // Another worker may have won the race; the next tick
                // re-evaluates from the indexer's fresh view.
                warn!(target: "mech.claim", request = %head.request.id, error = %err, "claim failed");
                Ok(None)
            }
        }
    }

    /// Gate one record. `Ok(needs_credentials)` when eligible.
    async fn evaluate(&self, record: &RequestRecord) -> Result<bool, Skip> {
        let request = &record.request;
        if request.delivered {
            return Err(Skip::AlreadyDelivered);
        }
        if self.seen.contains(&request.id) {
            return Err(Skip::AlreadySeen);
        }

        if !self.stake.is_staked(request.requester).await {
            return Err(Skip::NotStaked);
        }

        let required = self.provider_map.required_providers(&record.enabled_tools);
        let needs_credentials = !required.is_empty();
        if let Some(missing) = required.iter().find(|p| !self.providers.contains(*p)) {
            return Err(Skip::MissingCredentials(missing.clone()));
        }

        if !request.dependencies.is_empty() {
            let records = self
                .indexer
                .requests_by_ids(&request.dependencies)
                .await
                .map_err(|_| Skip::PendingDependency(request.dependencies[0]))?;
            let delivered: HashSet<RequestId> = records
                .iter()
                .filter(|r| r.request.delivered)
                .map(|r| r.request.id)
                .collect();
            if let Some(pending) = request
                .dependencies
                .iter()
                .find(|d| !delivered.contains(d))
            {
                return Err(Skip::PendingDependency(*pending));
            }
        }

        Ok(needs_credentials)
    }
}
