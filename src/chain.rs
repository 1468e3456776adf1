use crate::errors::{GatewayError, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha3::{Digest, Keccak256};
use std::time::Duration;
use tracing::{debug, error};

/// Read-only view of the launchpad token contracts.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// `maxMintCount()` — immutable contract constant.
    async fn max_mint_count(&self, token: &str) -> Result<u64>;
    /// `mintCount()` — the moving on-chain counter.
    async fn mint_count(&self, token: &str) -> Result<u64>;
    /// `deploymentDeadline()` — Unix seconds, immutable once deployed.
    async fn deployment_deadline(&self, token: &str) -> Result<u64>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<String>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

/// JSON-RPC `eth_call` client. One endpoint is chosen uniformly at random
/// from the configured set at construction and used for the client's
/// lifetime.
pub struct HttpChainClient {
    endpoint: String,
    client: Client,
}

impl HttpChainClient {
    pub fn new(rpc_urls: &[String], timeout_secs: u64) -> Result<Self> {
        if rpc_urls.is_empty() {
            return Err(GatewayError::Internal(
                "no chain RPC endpoints configured".to_string(),
            ));
        }
        let index = rand::thread_rng().gen_range(0..rpc_urls.len());
        let endpoint = rpc_urls[index].clone();

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GatewayError::Internal(format!("HTTP client build failed: {}", e)))?;

        debug!("Chain client using RPC endpoint {}", endpoint);
        Ok(HttpChainClient { endpoint, client })
    }

    async fn call_uint(&self, token: &str, signature: &str) -> Result<u64> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [
                { "to": token, "data": function_selector(signature) },
                "latest"
            ]
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Chain RPC request failed: {}", e);
                GatewayError::ChainRead(format!("{} request failed: {}", signature, e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(GatewayError::ChainRead(format!(
                "{} returned HTTP {}",
                signature, status
            )));
        }

        let rpc: RpcResponse = response.json().await.map_err(|e| {
            GatewayError::ChainRead(format!("{} response parse failed: {}", signature, e))
        })?;

        if let Some(err) = rpc.error {
            return Err(GatewayError::ChainRead(format!(
                "{} rejected: {}",
                signature, err.message
            )));
        }

        let hex_word = rpc.result.ok_or_else(|| {
            GatewayError::ChainRead(format!("{} returned an empty result", signature))
        })?;

        parse_uint_word(&hex_word)
            .ok_or_else(|| GatewayError::ChainRead(format!("{} returned {:?}", signature, hex_word)))
    }
}

#[async_trait]
impl ChainReader for HttpChainClient {
    async fn max_mint_count(&self, token: &str) -> Result<u64> {
        self.call_uint(token, "maxMintCount()").await
    }

    async fn mint_count(&self, token: &str) -> Result<u64> {
        self.call_uint(token, "mintCount()").await
    }

    async fn deployment_deadline(&self, token: &str) -> Result<u64> {
        self.call_uint(token, "deploymentDeadline()").await
    }
}

/// Four-byte ABI selector for a zero-argument call, hex-encoded with a
/// `0x` prefix.
fn function_selector(signature: &str) -> String {
    let digest = Keccak256::digest(signature.as_bytes());
    format!("0x{}", hex::encode(&digest[..4]))
}

/// Decode a 32-byte big-endian uint word as returned by `eth_call`.
/// Values beyond u64 are treated as malformed; the contract counters this
/// gateway reads never approach that range.
fn parse_uint_word(word: &str) -> Option<u64> {
    let trimmed = word.trim().strip_prefix("0x").unwrap_or(word.trim());
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let significant = trimmed.trim_start_matches('0');
    if significant.len() > 16 {
        return None;
    }
    if significant.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(significant, 16).ok()
}
