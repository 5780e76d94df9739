// SPDX-License-Identifier: MIT OR Apache-2.0
//! JSON-RPC transport.
//!
//! A thin typed client over `eth_*` methods with a 30-second per-call
//! timeout. Node errors are classified into [`ChainError`] here so every
//! caller sees the same taxonomy; revert payloads are decoded into their
//! `Error(string)` reason when the node returns them.

use crate::error::ChainError;
use alloy_primitives::{Address, B256, Bytes};
use alloy_sol_types::{SolCall, SolError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Per-call RPC timeout.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-RPC client for one endpoint.
#[derive(Debug)]
pub struct RpcClient {
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// One log entry from a transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RpcLog {
    /// Emitting contract.
    pub address: Address,
    /// Indexed topics; topic 0 is the event signature hash.
    #[serde(default)]
    pub topics: Vec<B256>,
    /// Non-indexed data.
    #[serde(default)]
    pub data: Bytes,
}

/// A transaction receipt, trimmed to what the worker consumes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    /// Hash of the mined transaction.
    pub transaction_hash: B256,
    /// Block the transaction landed in.
    #[serde(deserialize_with = "quantity_u64")]
    pub block_number: u64,
    /// Post-Byzantium status: 1 success, 0 revert.
    #[serde(deserialize_with = "quantity_u64")]
    pub status: u64,
    /// Logs emitted by the transaction.
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

impl TxReceipt {
    /// `true` when the transaction executed without reverting.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == 1
    }
}

fn quantity_u64<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    let raw = String::deserialize(de)?;
    u64::from_str_radix(raw.trim_start_matches("0x"), 16).map_err(serde::de::Error::custom)
}

impl RpcClient {
    /// Build a client for `url`.
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(RPC_TIMEOUT).build()?;
        Ok(Self {
            url: url.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!(target: "mech.chain.rpc", %method, id, "request");

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Rpc(format!("{method}: {e}")))?;
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| ChainError::Rpc(format!("{method}: {e}")))?;

        if let Some(error) = envelope.error {
            return Err(classify(method, error));
        }
        serde_json::from_value(envelope.result.unwrap_or(Value::Null))
            .map_err(|e| ChainError::Decode(format!("{method}: {e}")))
    }

    async fn quantity(&self, method: &str, params: Value) -> Result<u128, ChainError> {
        let raw: String = self.request(method, params).await?;
        u128::from_str_radix(raw.trim_start_matches("0x"), 16)
            .map_err(|e| ChainError::Decode(format!("{method}: {e}")))
    }

    /// `eth_chainId`.
    pub async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.quantity("eth_chainId", json!([])).await? as u64)
    }

    /// `eth_blockNumber`.
    pub async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.quantity("eth_blockNumber", json!([])).await? as u64)
    }

    /// `eth_gasPrice` in wei.
    pub async fn gas_price(&self) -> Result<u128, ChainError> {
        self.quantity("eth_gasPrice", json!([])).await
    }

    /// `eth_maxPriorityFeePerGas` in wei.
    pub async fn max_priority_fee(&self) -> Result<u128, ChainError> {
        self.quantity("eth_maxPriorityFeePerGas", json!([])).await
    }

    /// Pending-state nonce for `address`.
    pub async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        Ok(self
            .quantity("eth_getTransactionCount", json!([address, "pending"]))
            .await? as u64)
    }

    /// Operator balance in wei.
    pub async fn balance(&self, address: Address) -> Result<alloy_primitives::U256, ChainError> {
        let raw: String = self
            .request("eth_getBalance", json!([address, "latest"]))
            .await?;
        alloy_primitives::U256::from_str_radix(raw.trim_start_matches("0x"), 16)
            .map_err(|e| ChainError::Decode(format!("eth_getBalance: {e}")))
    }

    /// `eth_estimateGas` for a call from `from`.
    pub async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: alloy_primitives::U256,
        data: &[u8],
    ) -> Result<u64, ChainError> {
        let tx = json!({
            "from": from,
            "to": to,
            "value": format!("0x{value:x}"),
            "data": format!("0x{}", hex::encode(data)),
        });
        Ok(self.quantity("eth_estimateGas", json!([tx])).await? as u64)
    }

    /// `eth_call` against latest, optionally impersonating `from`.
    pub async fn call(
        &self,
        from: Option<Address>,
        to: Address,
        data: &[u8],
    ) -> Result<Vec<u8>, ChainError> {
        let mut tx = json!({
            "to": to,
            "data": format!("0x{}", hex::encode(data)),
        });
        if let Some(from) = from {
            tx["from"] = json!(from);
        }
        let raw: String = self.request("eth_call", json!([tx, "latest"])).await?;
        hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| ChainError::Decode(format!("eth_call: {e}")))
    }

    /// `eth_call` and decode the returns of `C`.
    pub async fn call_decoded<C: SolCall>(
        &self,
        to: Address,
        data: &[u8],
    ) -> Result<C::Return, ChainError> {
        let bytes = self.call(None, to, data).await?;
        C::abi_decode_returns(&bytes)
            .map_err(|e| ChainError::Decode(format!("{}: {e}", C::SIGNATURE)))
    }

    /// `eth_sendRawTransaction`; returns the transaction hash.
    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, ChainError> {
        self.request(
            "eth_sendRawTransaction",
            json!([format!("0x{}", hex::encode(raw))]),
        )
        .await
    }

    /// `eth_getTransactionReceipt`; `None` while pending.
    pub async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>, ChainError> {
        self.request("eth_getTransactionReceipt", json!([hash])).await
    }
}

/// Map a node error body onto the taxonomy.
fn classify(method: &str, error: ErrorBody) -> ChainError {
    let lowered = error.message.to_lowercase();
    if lowered.contains("insufficient funds") {
        return ChainError::InsufficientFunds;
    }
    if error.code == 3 || lowered.contains("revert") {
        let reason = error
            .data
            .as_ref()
            .and_then(Value::as_str)
            .and_then(decode_revert_reason)
            .or_else(|| {
                error
                    .message
                    .split_once("execution reverted:")
                    .map(|(_, tail)| tail.trim().to_string())
            });
        return ChainError::Reverted { reason };
    }
    ChainError::Rpc(format!("{method}: {} (code {})", error.message, error.code))
}

/// Decode an `Error(string)` revert payload into its reason.
fn decode_revert_reason(data_hex: &str) -> Option<String> {
    let bytes = hex::decode(data_hex.trim_start_matches("0x")).ok()?;
    alloy_sol_types::Revert::abi_decode(&bytes)
        .ok()
        .map(|revert| revert.reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::getStakingStateCall;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rpc_result(value: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": value,
        }))
    }

    fn rpc_error(code: i64, message: &str, data: Option<Value>) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": code, "message": message, "data": data},
        }))
    }

    #[tokio::test]
    async fn quantities_parse_hex() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(json!("0x64")))
            .mount(&server)
            .await;
        let rpc = RpcClient::new(server.uri()).unwrap();
        assert_eq!(rpc.chain_id().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn call_decoded_returns_typed_value() {
        // uint8 staking state 1, ABI-padded to a word.
        let word = format!("0x{:064x}", 1);
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(json!(word)))
            .mount(&server)
            .await;

        let rpc = RpcClient::new(server.uri()).unwrap();
        let call = getStakingStateCall {
            serviceId: alloy_primitives::U256::from(7u64),
        };
        let state = rpc
            .call_decoded::<getStakingStateCall>(Address::ZERO, &call.abi_encode())
            .await
            .unwrap();
        assert_eq!(state, 1);
    }

    #[tokio::test]
    async fn insufficient_funds_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_error(-32000, "insufficient funds for transfer", None))
            .mount(&server)
            .await;
        let rpc = RpcClient::new(server.uri()).unwrap();
        let err = rpc.gas_price().await.unwrap_err();
        assert!(matches!(err, ChainError::InsufficientFunds));
    }

    #[tokio::test]
    async fn revert_reason_is_decoded_from_data() {
        // Error("NotStaked") ABI payload.
        let revert = alloy_sol_types::Revert::from("NotStaked");
        let data = format!(
            "0x{}",
            hex::encode(alloy_sol_types::SolError::abi_encode(&revert))
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_error(3, "execution reverted", Some(json!(data))))
            .mount(&server)
            .await;

        let rpc = RpcClient::new(server.uri()).unwrap();
        let err = rpc.call(None, Address::ZERO, &[]).await.unwrap_err();
        let ChainError::Reverted { reason } = err else {
            panic!("expected revert, got {err:?}");
        };
        assert_eq!(reason.as_deref(), Some("NotStaked"));
    }

    #[tokio::test]
    async fn revert_reason_falls_back_to_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_error(3, "execution reverted: nope", None))
            .mount(&server)
            .await;
        let rpc = RpcClient::new(server.uri()).unwrap();
        let err = rpc.call(None, Address::ZERO, &[]).await.unwrap_err();
        let ChainError::Reverted { reason } = err else {
            panic!("expected revert");
        };
        assert_eq!(reason.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn pending_receipt_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(Value::Null))
            .mount(&server)
            .await;
        let rpc = RpcClient::new(server.uri()).unwrap();
        assert!(rpc
            .transaction_receipt(B256::ZERO)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn receipt_parses_quantities_and_logs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(json!({
                "transactionHash": format!("0x{}", "11".repeat(32)),
                "blockNumber": "0x10",
                "status": "0x1",
                "logs": [{
                    "address": format!("0x{}", "22".repeat(20)),
                    "topics": [format!("0x{}", "33".repeat(32))],
                    "data": "0x"
                }],
            })))
            .mount(&server)
            .await;
        let rpc = RpcClient::new(server.uri()).unwrap();
        let receipt = rpc.transaction_receipt(B256::ZERO).await.unwrap().unwrap();
        assert_eq!(receipt.block_number, 16);
        assert!(receipt.succeeded());
        assert_eq!(receipt.logs.len(), 1);
    }
}
