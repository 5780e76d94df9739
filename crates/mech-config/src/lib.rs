// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-config
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Worker configuration: a TOML file merged with `MECH_*` environment
//! overrides, validated once at boot. Libraries receive the resolved
//! [`WorkerConfig`] as an explicit parameter; nothing reads the environment
//! after startup.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Errors & warnings
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// An environment override held an unusable value.
    #[error("invalid value for {var}: {reason}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
    /// Semantic validation failed.
    #[error("config validation failed: {reasons:?}")]
    Validation {
        /// Individual failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory issues that do not prevent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Confirmations set to zero; receipts are accepted without depth.
    ZeroConfirmations,
    /// No gateway URL; legacy content resolution will miss its fallback.
    MissingGatewayUrl,
    /// In-flight cap above one without a serialized workspace is risky for
    /// coding jobs.
    HighInFlightCap {
        /// The configured cap.
        cap: u32,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::ZeroConfirmations => {
                write!(f, "confirmations = 0: receipts accepted without depth")
            }
            ConfigWarning::MissingGatewayUrl => {
                write!(f, "no gateway url configured; legacy content cannot fall back")
            }
            ConfigWarning::HighInFlightCap { cap } => {
                write!(f, "in-flight cap {cap} > 1: coding jobs serialize on the repo lock")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Chain endpoint and contract addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint.
    pub rpc_url: String,
    /// Chain id used for signing and HTTP signature key ids.
    pub chain_id: u64,
    /// Service id registered for this operator.
    pub service_id: u64,
    /// The operator's mech address (requests are routed to it).
    pub mech: Address,
    /// Marketplace contract.
    pub marketplace: Address,
    /// Service registry contract.
    pub registry: Address,
    /// Staking contract.
    pub staking: Address,
    /// Receipt confirmations to wait for on EOA submissions.
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
}

fn default_confirmations() -> u64 {
    1
}

/// Operator identity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Hex-encoded operator private key. Prefer the env override to the
    /// file form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Encrypted keystore path, used when no raw key is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore_path: Option<PathBuf>,
}

/// Content store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for the local blockstore.
    pub blockstore_dir: PathBuf,
    /// HTTP gateway base URL for fallback resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,
}

/// Indexer (GraphQL) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// GraphQL endpoint URL.
    pub url: String,
}

/// Credential broker settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker base URL; absent disables the credential gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Claim loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimConfig {
    /// Tick interval in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Maximum requests in flight at once.
    #[serde(default = "default_in_flight_cap")]
    pub in_flight_cap: u32,
    /// Trusted workers prioritize credential-demanding jobs.
    #[serde(default)]
    pub trusted: bool,
}

fn default_tick_interval_ms() -> u64 {
    5_000
}

fn default_in_flight_cap() -> u32 {
    1
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            in_flight_cap: default_in_flight_cap(),
            trusted: false,
        }
    }
}

/// Agent subprocess settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable to spawn.
    pub command: String,
    /// Fixed arguments prepended before per-run arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Wall-clock timeout in seconds.
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
    /// Models the agent may select from.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Model used when the job has no hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Run the reflection pass after execution.
    #[serde(default = "default_true")]
    pub reflection: bool,
    /// Tools this worker's agent supports (the tool registry).
    #[serde(default = "default_tools")]
    pub tools: Vec<String>,
}

fn default_tools() -> Vec<String> {
    ["create_artifact", "dispatch_new_job", "web_search"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_agent_timeout_secs() -> u64 {
    1_800
}

fn default_true() -> bool {
    true
}

/// Git workspace settings for coding jobs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GitConfig {
    /// Directory where repositories are cloned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
    /// Pre-existing repository path override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_dir: Option<PathBuf>,
    /// SSH host alias rewritten to `github.com` when validating remotes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_host_alias: Option<String>,
}

/// Peer admission settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GaterConfig {
    /// Peer ids admitted regardless of staking.
    #[serde(default)]
    pub trusted_peers: Vec<String>,
}

/// Health endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// TCP port for `GET /health`.
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_port() -> u16 {
    8716
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: default_health_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// The resolved worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Chain endpoint and contracts.
    pub chain: ChainConfig,
    /// Operator identity.
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Content store.
    pub store: StoreConfig,
    /// Indexer endpoint.
    pub indexer: IndexerConfig,
    /// Credential broker.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Claim loop.
    #[serde(default)]
    pub claim: ClaimConfig,
    /// Agent subprocess.
    pub agent: AgentConfig,
    /// Git workspace.
    #[serde(default)]
    pub git: GitConfig,
    /// Peer admission.
    #[serde(default)]
    pub gater: GaterConfig,
    /// Health endpoint.
    #[serde(default)]
    pub health: HealthConfig,
    /// Extra environment passed to the agent verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub agent_env: BTreeMap<String, String>,
}

impl WorkerConfig {
    /// Load from a TOML file, then apply `MECH_*` environment overrides.
    ///
    /// A `.env` file in the working directory is honored first, matching
    /// local development setups.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        let mut config: WorkerConfig = toml::from_str(&raw)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `MECH_*` environment overrides in place.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("MECH_PRIVATE_KEY") {
            self.identity.private_key = Some(v);
        }
        if let Ok(v) = std::env::var("MECH_RPC_URL") {
            self.chain.rpc_url = v;
        }
        if let Ok(v) = std::env::var("MECH_CHAIN_ID") {
            self.chain.chain_id = parse_env("MECH_CHAIN_ID", &v)?;
        }
        if let Ok(v) = std::env::var("MECH_SERVICE_ID") {
            self.chain.service_id = parse_env("MECH_SERVICE_ID", &v)?;
        }
        if let Ok(v) = std::env::var("MECH_CONFIRMATIONS") {
            self.chain.confirmations = parse_env("MECH_CONFIRMATIONS", &v)?;
        }
        if let Ok(v) = std::env::var("MECH_GATEWAY_URL") {
            self.store.gateway_url = Some(v);
        }
        if let Ok(v) = std::env::var("MECH_INDEXER_URL") {
            self.indexer.url = v;
        }
        if let Ok(v) = std::env::var("MECH_BROKER_URL") {
            self.broker.url = Some(v);
        }
        if let Ok(v) = std::env::var("MECH_TICK_INTERVAL_MS") {
            self.claim.tick_interval_ms = parse_env("MECH_TICK_INTERVAL_MS", &v)?;
        }
        if let Ok(v) = std::env::var("MECH_IN_FLIGHT_CAP") {
            self.claim.in_flight_cap = parse_env("MECH_IN_FLIGHT_CAP", &v)?;
        }
        if let Ok(v) = std::env::var("MECH_AGENT_COMMAND") {
            self.agent.command = v;
        }
        if let Ok(v) = std::env::var("MECH_AGENT_TIMEOUT_SECS") {
            self.agent.timeout_secs = parse_env("MECH_AGENT_TIMEOUT_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("MECH_WORKSPACE_DIR") {
            self.git.workspace_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("MECH_REPO_DIR") {
            self.git.repo_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("MECH_SSH_HOST_ALIAS") {
            self.git.ssh_host_alias = Some(v);
        }
        if let Ok(v) = std::env::var("MECH_HEALTH_PORT") {
            self.health.port = parse_env("MECH_HEALTH_PORT", &v)?;
        }
        if let Ok(v) = std::env::var("MECH_TRUSTED_PEERS") {
            self.gater.trusted_peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }

    /// Semantic validation. Hard failures are errors; soft issues come back
    /// as warnings for the operator log.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        if self.chain.rpc_url.trim().is_empty() {
            reasons.push("chain.rpc_url must not be empty".to_string());
        }
        if self.indexer.url.trim().is_empty() {
            reasons.push("indexer.url must not be empty".to_string());
        }
        if self.agent.command.trim().is_empty() {
            reasons.push("agent.command must not be empty".to_string());
        }
        if self.identity.private_key.is_none() && self.identity.keystore_path.is_none() {
            reasons.push("identity requires private_key or keystore_path".to_string());
        }
        if self.claim.in_flight_cap == 0 {
            reasons.push("claim.in_flight_cap must be at least 1".to_string());
        }
        if !reasons.is_empty() {
            return Err(ConfigError::Validation { reasons });
        }

        let mut warnings = Vec::new();
        if self.chain.confirmations == 0 {
            warnings.push(ConfigWarning::ZeroConfirmations);
        }
        if self.store.gateway_url.is_none() {
            warnings.push(ConfigWarning::MissingGatewayUrl);
        }
        if self.claim.in_flight_cap > 1 {
            warnings.push(ConfigWarning::HighInFlightCap {
                cap: self.claim.in_flight_cap,
            });
        }
        Ok(warnings)
    }
}

fn parse_env<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [chain]
        rpc_url = "http://localhost:8545"
        chain_id = 100
        service_id = 7
        mech = "0x00000000000000000000000000000000000000bb"
        marketplace = "0x0000000000000000000000000000000000000001"
        registry = "0x0000000000000000000000000000000000000002"
        staking = "0x0000000000000000000000000000000000000003"

        [identity]
        private_key = "0x01"

        [store]
        blockstore_dir = "/tmp/blocks"
        gateway_url = "https://gateway.example"

        [indexer]
        url = "http://localhost:42069/graphql"

        [agent]
        command = "agent"
    "#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_minimal_toml_with_defaults() {
        let file = write_config(MINIMAL);
        let config = WorkerConfig::load(file.path()).unwrap();
        assert_eq!(config.chain.confirmations, 1);
        assert_eq!(config.claim.tick_interval_ms, 5_000);
        assert_eq!(config.claim.in_flight_cap, 1);
        assert_eq!(config.health.port, 8716);
        assert!(config.agent.reflection);
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_a_distinct_error() {
        let err = WorkerConfig::load(Path::new("/nonexistent/mech.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn validation_rejects_missing_identity() {
        let file = write_config(&MINIMAL.replace("private_key = \"0x01\"", ""));
        let config = WorkerConfig::load(file.path()).unwrap();
        let err = config.validate().unwrap_err();
        let ConfigError::Validation { reasons } = err else {
            panic!("expected validation error");
        };
        assert!(reasons.iter().any(|r| r.contains("identity")));
    }

    #[test]
    fn zero_confirmations_warns() {
        let file = write_config(MINIMAL);
        let mut config = WorkerConfig::load(file.path()).unwrap();
        config.chain.confirmations = 0;
        let warnings = config.validate().unwrap();
        assert!(warnings.contains(&ConfigWarning::ZeroConfirmations));
    }

    #[test]
    fn high_in_flight_cap_warns() {
        let file = write_config(MINIMAL);
        let mut config = WorkerConfig::load(file.path()).unwrap();
        config.claim.in_flight_cap = 4;
        let warnings = config.validate().unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::HighInFlightCap { cap: 4 })));
    }
}
