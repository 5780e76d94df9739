// SPDX-License-Identifier: MIT OR Apache-2.0
//! Credential broker client and the tool → provider map.
//!
//! The worker probes the broker once at startup with a signed request and
//! learns which credential providers it holds; the claim loop then gates
//! credential-demanding jobs on that set.

use chrono::Utc;
use mech_signer::OperatorSigner;
use mech_signer::http::sign_request;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Broker request timeout.
const BROKER_TIMEOUT: Duration = Duration::from_secs(10);

/// Static mapping from tool names to the credential provider they need.
///
/// Tools outside the map need no credentials.
#[derive(Debug, Clone)]
pub struct ToolProviderMap {
    map: BTreeMap<String, String>,
}

impl Default for ToolProviderMap {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        for (tool, provider) in [
            ("github_create_pr", "github"),
            ("github_read_repo", "github"),
            ("google_calendar", "google"),
            ("google_drive", "google"),
            ("gmail_send", "google"),
            ("slack_post", "slack"),
            ("stripe_invoice", "stripe"),
            ("web_search", "search"),
        ] {
            map.insert(tool.to_string(), provider.to_string());
        }
        Self { map }
    }
}

impl ToolProviderMap {
    /// Build from explicit pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self {
            map: pairs
                .into_iter()
                .map(|(tool, provider)| (tool.into(), provider.into()))
                .collect(),
        }
    }

    /// Providers required by a tool list (deduplicated).
    #[must_use]
    pub fn required_providers(&self, tools: &[String]) -> HashSet<String> {
        tools
            .iter()
            .filter_map(|tool| self.map.get(tool))
            .cloned()
            .collect()
    }
}

/// Errors from the broker surface.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Transport failure.
    #[error("broker transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// Request signing failed.
    #[error("broker signing: {0}")]
    Signing(#[from] mech_signer::http::HttpSignatureError),
}

#[derive(Debug, Deserialize)]
struct CapabilitiesResponse {
    #[serde(default)]
    providers: Vec<String>,
}

/// One operator in the broker's network view.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorEntry {
    /// Operator address.
    pub address: alloy_primitives::Address,
    /// Reachable multiaddrs.
    #[serde(default)]
    pub multiaddrs: Vec<String>,
    /// Registered service id, when known.
    #[serde(default)]
    pub service_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NetworkResponse {
    #[serde(default)]
    operators: Vec<OperatorEntry>,
}

/// HTTPS client for the credential broker.
pub struct BrokerClient {
    base: String,
    client: reqwest::Client,
    signer: OperatorSigner,
}

impl BrokerClient {
    /// Build a client for the broker at `base`.
    pub fn new(base: impl Into<String>, signer: OperatorSigner) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder().timeout(BROKER_TIMEOUT).build()?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
            signer,
        })
    }

    /// `POST /credentials/capabilities` (RFC-9421 signed): the providers
    /// this operator holds credentials for.
    pub async fn capabilities(&self) -> Result<HashSet<String>, BrokerError> {
        let url = format!("{}/credentials/capabilities", self.base);
        let nonce = Uuid::new_v4().to_string();
        let headers = sign_request(&self.signer, "POST", &url, &nonce, Utc::now())?;

        let response: CapabilitiesResponse = self
            .client
            .post(&url)
            .header("signature-input", headers.signature_input)
            .header("signature", headers.signature)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        info!(
            target: "mech.claim",
            providers = response.providers.len(),
            "credential capabilities discovered"
        );
        Ok(response.providers.into_iter().collect())
    }

    /// `GET /admin/operators/network`: the staked operator directory.
    pub async fn operators_network(&self) -> Result<Vec<OperatorEntry>, BrokerError> {
        let url = format!("{}/admin/operators/network", self.base);
        let response: NetworkResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.operators)
    }
}
