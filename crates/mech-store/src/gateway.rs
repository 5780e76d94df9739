// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP gateway fallback with backoff.

use mech_retry::BackoffPolicy;
use std::time::Duration;
use tracing::debug;

/// Per-request gateway timeout.
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Gateway transport failures, post-retry.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Connection, timeout, or protocol failure.
    #[error("gateway transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// The gateway kept answering 5xx until retries ran out.
    #[error("gateway server error {0}")]
    Server(reqwest::StatusCode),
}

impl GatewayError {
    fn retryable(&self) -> bool {
        match self {
            GatewayError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            GatewayError::Server(_) => true,
        }
    }
}

/// An IPFS HTTP gateway client.
#[derive(Debug, Clone)]
pub struct Gateway {
    base: String,
    client: reqwest::Client,
    policy: BackoffPolicy,
}

impl Gateway {
    /// Build a gateway client for `base` (e.g. `https://ipfs.example`).
    pub fn new(base: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
            policy: BackoffPolicy::gateway(),
        })
    }

    /// Override the backoff policy (tests use a zero-delay policy).
    #[must_use]
    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fetch `/ipfs/<path>`.
    ///
    /// `path` is a CID string, optionally suffixed with `/<name>` for
    /// directory-wrapped legacy content. Transport failures and 5xx are
    /// retried with backoff; 404 resolves to `Ok(None)` immediately.
    pub async fn fetch(&self, path: &str) -> Result<Option<Vec<u8>>, GatewayError> {
        let url = format!("{}/ipfs/{}", self.base, path);
        mech_retry::retry(
            &self.policy,
            "gateway.fetch",
            GatewayError::retryable,
            || async {
                let response = self.client.get(&url).send().await?;
                let status = response.status();
                if status == reqwest::StatusCode::NOT_FOUND {
                    debug!(target: "mech.store", %url, "gateway 404");
                    return Ok(None);
                }
                if status.is_server_error() {
                    return Err(GatewayError::Server(status));
                }
                let bytes = response.error_for_status()?.bytes().await?;
                Ok(Some(bytes.to_vec()))
            },
        )
        .await
    }
}
