// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-daemon
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The worker runtime: builds every component from the resolved config,
//! drives the claim loop into a bounded worker pool, serves `GET /health`,
//! and shuts the whole thing down on a single signal after the in-flight
//! request settles.

/// Health endpoint.
pub mod health;
/// Stake view and claim submission over the chain gateway.
pub mod stake;

use anyhow::Context;
use mech_chain::{ChainAddresses, ChainGateway, RpcClient};
use mech_claim::credentials::{BrokerClient, ToolProviderMap};
use mech_claim::shutdown::ShutdownToken;
use mech_claim::ClaimLoop;
use mech_config::WorkerConfig;
use mech_core::Request;
use mech_delivery::dispatch::Dispatcher;
use mech_delivery::{DeliveryService, SettleOutcome};
use mech_gater::AdmissionGater;
use mech_indexer::IndexerClient;
use mech_pipeline::{Pipeline, PipelineVerdict};
use mech_signer::OperatorSigner;
use mech_store::blockstore::Blockstore;
use mech_store::gateway::Gateway;
use mech_store::ContentStore;
use mech_telemetry::WorkerMetrics;
use stake::{GaterStakeView, SafeClaimSubmitter};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Delay before a requeued request re-enters the worker queue.
const REQUEUE_DELAY: Duration = Duration::from_secs(30);

/// Build the operator signer from config (raw key or keystore).
pub fn build_signer(config: &WorkerConfig) -> anyhow::Result<OperatorSigner> {
    if let Some(key) = &config.identity.private_key {
        return OperatorSigner::from_hex(key, config.chain.chain_id)
            .context("operator private key");
    }
    if let Some(path) = &config.identity.keystore_path {
        let password = std::env::var("MECH_KEYSTORE_PASSWORD")
            .context("MECH_KEYSTORE_PASSWORD required for keystore identity")?;
        let key = mech_signer::keystore::load(path, &password).context("keystore decrypt")?;
        return OperatorSigner::from_bytes(&key, config.chain.chain_id)
            .context("keystore key material");
    }
    anyhow::bail!("no operator identity configured")
}

/// Run the worker until a shutdown signal.
pub async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let warnings = config.validate()?;
    for warning in &warnings {
        warn!(target: "mech.daemon", %warning, "config warning");
    }

    let signer = build_signer(&config)?;
    info!(target: "mech.daemon", operator = %signer.address(), "operator identity loaded");

    // Chain gateway + boot-time service resolution (single resolution,
    // cached for the process lifetime).
    let rpc = RpcClient::new(config.chain.rpc_url.clone())?;
    let chain = Arc::new(ChainGateway::new(
        rpc,
        signer.clone(),
        ChainAddresses {
            marketplace: config.chain.marketplace,
            registry: config.chain.registry,
            staking: config.chain.staking,
        },
        config.chain.confirmations,
    ));
    let safe = chain
        .resolve_service_safe(config.chain.service_id)
        .await
        .context("service safe resolution")?;
    info!(target: "mech.daemon", %safe, service_id = config.chain.service_id, "service safe resolved");

    // Content store.
    let blockstore = Blockstore::open(&config.store.blockstore_dir).await?;
    let gateway = match &config.store.gateway_url {
        Some(url) => Some(Gateway::new(url.clone())?),
        None => None,
    };
    let store = Arc::new(ContentStore::new(blockstore, gateway));

    let indexer = IndexerClient::new(config.indexer.url.clone())?;

    // Credential probe: one signed request at startup.
    let providers = match &config.broker.url {
        Some(url) => {
            let broker = BrokerClient::new(url.clone(), signer.clone())?;
            match broker.capabilities().await {
                Ok(providers) => providers,
                Err(err) => {
                    warn!(target: "mech.daemon", error = %err, "credential probe failed; claiming credential-free jobs only");
                    HashSet::new()
                }
            }
        }
        None => HashSet::new(),
    };

    // Staked-operator view shared by admission and the claim loop.
    let stake_source = match &config.broker.url {
        Some(url) => stake::BrokerStakeSource::new(
            BrokerClient::new(url.clone(), signer.clone())?,
            chain.clone(),
        ),
        None => stake::BrokerStakeSource::chain_only(chain.clone()),
    };
    let gater = Arc::new(AdmissionGater::new(
        stake_source,
        config.gater.trusted_peers.clone(),
    ));

    let metrics = WorkerMetrics::started_now();
    let shutdown = ShutdownToken::new();

    // Health endpoint.
    let node_id: String = format!("{safe:x}").chars().take(8).collect();
    let health_handle = tokio::spawn(health::serve(
        config.health.port,
        node_id,
        metrics.clone(),
        shutdown.clone(),
    ));

    // Pipeline + delivery.
    let tool_registry: HashSet<String> = config.agent.tools.iter().cloned().collect();
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        indexer.clone(),
        tool_registry,
        config.agent.clone(),
        config.git.clone(),
        config.agent_env.clone(),
    ));
    let dispatcher = Dispatcher::new(store.clone(), chain.clone(), safe, config.chain.mech);
    let delivery = Arc::new(DeliveryService::new(
        store.clone(),
        indexer.clone(),
        dispatcher,
    ));

    // Claim loop feeding the worker pool.
    let queue_capacity = (config.claim.in_flight_cap as usize).max(1);
    let (queue_tx, queue_rx) = mpsc::channel::<Request>(queue_capacity);
    let claim_loop = ClaimLoop::new(
        indexer.clone(),
        SafeClaimSubmitter::new(chain.clone(), safe),
        GaterStakeView::new(gater.clone()),
        providers,
        ToolProviderMap::default(),
        config.chain.mech,
        config.claim.trusted,
        Duration::from_millis(config.claim.tick_interval_ms),
        metrics.clone(),
    );
    let claim_handle = tokio::spawn(claim_loop.run(queue_tx.clone(), shutdown.clone()));

    // Worker pool: in_flight_cap consumers over one queue.
    let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
    let mut worker_handles = Vec::new();
    for worker_index in 0..queue_capacity {
        worker_handles.push(tokio::spawn(worker_loop(
            worker_index,
            queue_rx.clone(),
            queue_tx.clone(),
            pipeline.clone(),
            delivery.clone(),
            metrics.clone(),
            shutdown.clone(),
        )));
    }
    drop(queue_tx);

    // Single shutdown signal.
    tokio::signal::ctrl_c().await.ok();
    info!(target: "mech.daemon", "shutdown signal received");
    shutdown.signal();

    claim_handle.await.ok();
    for handle in worker_handles {
        handle.await.ok();
    }
    health_handle.await.ok();
    info!(target: "mech.daemon", "worker stopped");
    Ok(())
}

/// One worker: pull a claimed request, run the pipeline, settle.
async fn worker_loop(
    worker_index: usize,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Request>>>,
    queue_tx: mpsc::Sender<Request>,
    pipeline: Arc<Pipeline>,
    delivery: Arc<DeliveryService>,
    metrics: WorkerMetrics,
    shutdown: ShutdownToken,
) {
    loop {
        let request = {
            let mut rx = queue_rx.lock().await;
            tokio::select! {
                request = rx.recv() => request,
                () = shutdown.signalled() => None,
            }
        };
        let Some(request) = request else { break };

        let started = Instant::now();
        let run = pipeline.execute(&request).await;
        let requeue = matches!(run.verdict, PipelineVerdict::Requeue { .. });

        match delivery.settle(&run).await {
            Ok(SettleOutcome::Delivered { digest_hex, dispatched }) => {
                info!(
                    target: "mech.daemon",
                    worker = worker_index,
                    request = %request.id,
                    %digest_hex,
                    lineage = dispatched.len(),
                    "request settled"
                );
            }
            Ok(SettleOutcome::AlreadyDelivered) => {
                info!(target: "mech.daemon", request = %request.id, "already settled");
            }
            Ok(SettleOutcome::Requeued { reason }) => {
                info!(target: "mech.daemon", request = %request.id, %reason, "requeued");
            }
            Err(fault) => {
                warn!(target: "mech.daemon", request = %request.id, %fault, "settlement failed");
            }
        }
        metrics.record_job(started.elapsed());

        if requeue && !shutdown.is_shutdown() {
            let tx = queue_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(REQUEUE_DELAY).await;
                let _ = tx.send(request).await;
            });
        }
    }
}
