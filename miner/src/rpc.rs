//! Solo-mode node client: JSON-RPC over HTTP.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::work::TemplateTx;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// One block template from `getBlockTemplate`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplate {
    pub height: u64,
    /// Header hex with zeroed nonce/extranonce slots.
    pub header: String,
    /// Big-endian target hex.
    pub target: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub transactions: Vec<TemplateTx>,
}

impl BlockTemplate {
    /// Identity used to decide whether a poll brought new work.
    pub fn fingerprint(&self) -> (u64, String) {
        (self.height, self.header.clone())
    }
}

pub struct NodeRpcClient {
    url: String,
    client: reqwest::Client,
}

impl NodeRpcClient {
    pub fn new(url: &str) -> Result<Self> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(anyhow!("node URL must start with http:// or https://"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let payload = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: 1,
            method: method.to_string(),
            params,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("rpc connection failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("rpc http error: {}", status));
        }
        let rpc: RpcResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("rpc decode failed: {}", e))?;
        if let Some(err) = rpc.error {
            if !err.is_null() {
                return Err(anyhow!("rpc error: {}", err));
            }
        }
        Ok(rpc.result.unwrap_or(Value::Null))
    }

    pub async fn get_block_template(&self, miner_address: &str) -> Result<BlockTemplate> {
        let result = self
            .call("getBlockTemplate", json!({ "pay_address": miner_address }))
            .await?;
        let template: BlockTemplate = serde_json::from_value(result)
            .map_err(|e| anyhow!("bad block template: {}", e))?;
        Ok(template)
    }

    /// Submit a found block. `Ok(true)` means the node took it.
    pub async fn submit_block(&self, block_hex: &str) -> Result<bool> {
        let result = self.call("submitBlock", json!([block_hex])).await?;
        let accepted = if let Some(b) = result.as_bool() {
            b
        } else if let Some(obj) = result.as_object() {
            obj.get("accepted")
                .and_then(|v| v.as_bool())
                .or_else(|| {
                    obj.get("status")
                        .and_then(|s| s.as_str())
                        .map(|s| s.eq_ignore_ascii_case("accepted") || s.eq_ignore_ascii_case("ok"))
                })
                .unwrap_or(false)
        } else {
            false
        };
        Ok(accepted)
    }
}
