// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command implementations.

use anyhow::Context;
use mech_chain::{
    ChainAddresses, ChainGateway, RpcClient, SERVICE_STATE_DEPLOYED, STAKING_STATE_STAKED,
};
use mech_config::WorkerConfig;
use mech_indexer::IndexerClient;
use std::path::Path;

fn load_config(path: &Path) -> anyhow::Result<WorkerConfig> {
    WorkerConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

/// `run`: the long-lived worker loop.
pub async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    mech_daemon::run(config).await
}

/// `status`: query a running worker's health endpoint; fall back to a
/// local config summary when no worker is listening.
pub async fn status(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let url = format!("http://127.0.0.1:{}/health", config.health.port);

    match reqwest::get(&url).await {
        Ok(response) => {
            let body: serde_json::Value = response.json().await.context("health body")?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Err(_) => {
            println!("worker not running (no listener on port {})", config.health.port);
            println!("  service id: {}", config.chain.service_id);
            println!("  mech:       {}", config.chain.mech);
            println!("  rpc:        {}", config.chain.rpc_url);
            println!("  indexer:    {}", config.indexer.url);
        }
    }
    Ok(())
}

/// `sync`: one-shot service + staking resolution.
pub async fn sync(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let signer = mech_daemon::build_signer(&config)?;
    let chain = ChainGateway::new(
        RpcClient::new(config.chain.rpc_url.clone())?,
        signer,
        ChainAddresses {
            marketplace: config.chain.marketplace,
            registry: config.chain.registry,
            staking: config.chain.staking,
        },
        config.chain.confirmations,
    );

    let service = chain.get_service(config.chain.service_id).await?;
    let staking_state = chain.staking_state(config.chain.service_id).await?;
    let safe = chain.resolve_service_safe(config.chain.service_id).await?;

    println!("service {}:", config.chain.service_id);
    println!(
        "  registry state: {} ({})",
        service.state,
        if service.state == SERVICE_STATE_DEPLOYED {
            "deployed"
        } else {
            "not deployed"
        }
    );
    println!(
        "  staking:        {} ({})",
        staking_state,
        if staking_state == STAKING_STATE_STAKED {
            "staked"
        } else {
            "not staked"
        }
    );
    println!("  effective safe: {safe}");
    Ok(())
}

/// `list`: undelivered requests for this worker's mech, oldest first.
pub async fn list(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let indexer = IndexerClient::new(config.indexer.url.clone())?;
    let records = indexer.undelivered_requests(config.chain.mech, 50).await?;

    if records.is_empty() {
        println!("no undelivered requests for mech {}", config.chain.mech);
        return Ok(());
    }
    println!("{} undelivered request(s):", records.len());
    for record in records {
        println!(
            "  {}  ts={}  deps={}  job={}",
            record.request.id,
            record.request.block_timestamp,
            record.request.dependencies.len(),
            record.job_definition_id.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
