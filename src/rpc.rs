//! JSON-RPC client for Ethereum nodes
//!
//! Provides a typed interface to Ethereum JSON-RPC endpoints and the
//! [`ChainReader`] trait the poller is written against.

use crate::types::{parse_hex_u64, Block, Receipt};
use alloy_primitives::B256;
use anyhow::{Context, Result};
use serde_json::{json, Value};

/// Read-only view of the chain consumed by the poller.
///
/// Implementations do no retrying of their own: a failed call aborts the
/// current poll cycle and is retried on the next tick.
#[allow(async_fn_in_trait)]
pub trait ChainReader {
    /// Fetch a block with full transaction objects. `None` if the node doesn't have it.
    async fn block_by_height(&self, height: u64) -> Result<Option<Block>>;

    /// Fetch a transaction receipt. `None` if the node doesn't know the transaction.
    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>>;

    /// Current chain head height.
    async fn head_height(&self) -> Result<u64>;
}

/// JSON-RPC client for Ethereum nodes.
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
}

impl RpcClient {
    /// Create a new RPC client.
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    /// Make a JSON-RPC call.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .context("Failed to send RPC request")?;

        let json: Value = response
            .json()
            .await
            .context("Failed to parse RPC response")?;

        // Check for RPC error
        if let Some(error) = json.get("error") {
            anyhow::bail!("RPC error: {}", error);
        }

        // Extract result
        json.get("result")
            .cloned()
            .context("RPC response missing 'result' field")
    }

    /// Parse a hex quantity result such as `"0x1b4"`.
    fn quantity(value: &Value, what: &str) -> Result<u64> {
        let s = value
            .as_str()
            .with_context(|| format!("{} response is not a string", what))?;
        if s.strip_prefix("0x").unwrap_or(s).is_empty() {
            anyhow::bail!("{} is empty", what);
        }
        parse_hex_u64(s).with_context(|| format!("Failed to parse {}", what))
    }

    /// Get a block by number with full transaction details.
    ///
    /// Returns `None` when the node answers `null` (block not yet available).
    pub async fn get_block_by_number(&self, number: u64) -> Result<Option<Block>> {
        let params = json!([format!("0x{:x}", number), true]);
        let result = self.call("eth_getBlockByNumber", params).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .context("Failed to deserialize block")
    }

    /// Get the latest block number.
    pub async fn get_block_number(&self) -> Result<u64> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        Self::quantity(&result, "Block number")
    }

    /// Get the chain id of the connected network.
    pub async fn get_chain_id(&self) -> Result<u64> {
        let result = self.call("eth_chainId", json!([])).await?;
        Self::quantity(&result, "Chain id")
    }

    /// Get a transaction receipt by hash.
    pub async fn get_transaction_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>> {
        let hash_str = format!("0x{:x}", tx_hash);
        let params = json!([hash_str]);
        let result = self.call("eth_getTransactionReceipt", params).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .context("Failed to deserialize receipt")
    }
}

impl ChainReader for RpcClient {
    async fn block_by_height(&self, height: u64) -> Result<Option<Block>> {
        self.get_block_by_number(height).await
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>> {
        self.get_transaction_receipt(tx_hash).await
    }

    async fn head_height(&self) -> Result<u64> {
        self.get_block_number().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantity_parsing() {
        assert_eq!(RpcClient::quantity(&json!("0x1b4"), "Block number").unwrap(), 436);
        assert_eq!(RpcClient::quantity(&json!("0x0"), "Block number").unwrap(), 0);
        assert!(RpcClient::quantity(&json!("0x"), "Block number").is_err());
        assert!(RpcClient::quantity(&json!(12), "Block number").is_err());
    }

    #[test]
    fn test_hash_formatting() {
        let hash = B256::repeat_byte(0xab);
        assert_eq!(format!("0x{:x}", hash), format!("0x{}", "ab".repeat(32)));
    }
}
