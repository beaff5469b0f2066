//! Minimal EVM JSON-RPC client
//!
//! Only the calls needed to price, sign, send and confirm one approval
//! transaction. The transport is a trait so the dispatcher can be driven
//! without a network in tests.

use async_trait::async_trait;
use ethabi::ethereum_types::U256;
use ethabi::Address;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::types::{format_address, parse_hex_u256, parse_hex_u64};
use crate::error::{Error, Result};

/// Calls whose errors can be a node's verdict on the transaction itself
const TRANSACTION_METHODS: &[&str] = &["eth_sendRawTransaction", "eth_estimateGas"];

/// JSON-RPC codes nodes use for execution and transaction validation errors
const TRANSACTION_VERDICT_CODES: &[i64] = &[-32000, -32003, -32010, 3];

/// Messages that ride on a verdict code but describe the node's own state
const NODE_CONDITION_MARKERS: &[&str] = &[
    "rate limit",
    "too many requests",
    "header not found",
    "timeout",
    "timed out",
    "try again",
    "unavailable",
];

/// Sends one JSON-RPC request to one endpoint
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request(&self, endpoint: &str, method: &str, params: Value) -> Result<Value>;
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    timeout_ms: u64,
}

impl HttpTransport {
    pub fn new(timeout_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, timeout_ms })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn request(&self, endpoint: &str, method: &str, params: Value) -> Result<Value> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::RpcTimeout(self.timeout_ms)
                } else {
                    Error::RpcConnection(e.to_string())
                }
            })?;

        if let Some(err) = classify_http_status(method, response.status()) {
            return Err(err);
        }

        let payload: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| Error::Rpc(format!("Failed to parse {} response: {}", method, e)))?;

        if let Some(err) = payload.error {
            return Err(classify_rpc_error(method, err.code, &err.message));
        }

        Ok(payload.result.unwrap_or(Value::Null))
    }
}

/// Any non-2xx reply is a failure of the endpoint, never of the transaction
pub fn classify_http_status(method: &str, status: StatusCode) -> Option<Error> {
    if status.is_success() {
        return None;
    }
    Some(Error::Rpc(format!("{} returned HTTP {}", method, status)))
}

/// Map a JSON-RPC error object onto endpoint failures vs transaction verdicts
///
/// Only execution and validation errors from sending or estimating the
/// transaction are verdicts; everything else lets the dispatcher move on.
pub fn classify_rpc_error(method: &str, code: i64, message: &str) -> Error {
    let detail = format!("{} code={} message={}", method, code, message);
    let lowered = message.to_lowercase();
    let node_condition = NODE_CONDITION_MARKERS.iter().any(|m| lowered.contains(m));

    if TRANSACTION_METHODS.contains(&method)
        && TRANSACTION_VERDICT_CODES.contains(&code)
        && !node_condition
    {
        Error::TransactionRejected(detail)
    } else {
        Error::Rpc(detail)
    }
}

/// Receipt fields the dispatcher cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub block_number: Option<u64>,
    pub success: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: Option<String>,
    block_number: Option<String>,
    status: Option<String>,
}

/// Typed calls against a single endpoint
pub struct EvmRpcClient<'a> {
    transport: &'a dyn RpcTransport,
    endpoint: &'a str,
}

impl<'a> EvmRpcClient<'a> {
    pub fn new(transport: &'a dyn RpcTransport, endpoint: &'a str) -> Self {
        Self {
            transport,
            endpoint,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        debug!(method, "rpc call");
        self.transport.request(self.endpoint, method, params).await
    }

    async fn call_quantity(&self, method: &str, params: Value) -> Result<U256> {
        let value = self.call(method, params).await?;
        let raw = value
            .as_str()
            .ok_or_else(|| Error::Rpc(format!("{} returned non-string result", method)))?;
        parse_hex_u256(raw)
    }

    pub async fn chain_id(&self) -> Result<u64> {
        let value = self.call("eth_chainId", serde_json::json!([])).await?;
        let raw = value
            .as_str()
            .ok_or_else(|| Error::Rpc("eth_chainId returned non-string result".to_string()))?;
        parse_hex_u64(raw)
    }

    pub async fn pending_nonce(&self, address: &Address) -> Result<U256> {
        self.call_quantity(
            "eth_getTransactionCount",
            serde_json::json!([format_address(address), "pending"]),
        )
        .await
    }

    pub async fn gas_price(&self) -> Result<U256> {
        self.call_quantity("eth_gasPrice", serde_json::json!([])).await
    }

    pub async fn estimate_gas(&self, from: &Address, to: &Address, data: &[u8]) -> Result<U256> {
        self.call_quantity(
            "eth_estimateGas",
            serde_json::json!([{
                "from": format_address(from),
                "to": format_address(to),
                "data": format!("0x{}", hex::encode(data)),
            }]),
        )
        .await
    }

    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String> {
        let value = self
            .call(
                "eth_sendRawTransaction",
                serde_json::json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Rpc("eth_sendRawTransaction returned no hash".to_string()))
    }

    pub async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>> {
        let value = self
            .call("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }

        let raw: RawReceipt = serde_json::from_value(value)?;
        let block_number = raw.block_number.as_deref().map(parse_hex_u64).transpose()?;
        let success = raw
            .status
            .as_deref()
            .map(parse_hex_u64)
            .transpose()?
            .map(|v| v == 1)
            .unwrap_or(false);

        Ok(Some(TransactionReceipt {
            transaction_hash: raw.transaction_hash.unwrap_or_else(|| tx_hash.to_string()),
            block_number,
            success,
        }))
    }
}
