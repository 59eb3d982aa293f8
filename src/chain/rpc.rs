//! JSON-RPC client for bitcoind-style nodes
//!
//! Speaks JSON-RPC 1.0 over HTTP with basic authentication. Nodes report RPC
//! failures with a non-200 status and an error object in the body, so the
//! body is parsed before the status is judged.

use super::{AddressInfo, BlockTemplate, ChainNode, HeaderStatus, RetryPolicy};
use crate::crypto::Hash256;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

/// Error code bitcoind returns for unknown blocks
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// Per-call retry policies
#[derive(Debug, Clone)]
pub struct RpcPolicies {
    pub template: RetryPolicy,
    pub submit: RetryPolicy,
    pub header: RetryPolicy,
    pub address: RetryPolicy,
}

impl Default for RpcPolicies {
    fn default() -> Self {
        Self {
            template: RetryPolicy::once(),
            submit: RetryPolicy::fixed(3),
            header: RetryPolicy::once(),
            address: RetryPolicy::fixed(2),
        }
    }
}

/// Node RPC client
pub struct RpcClient {
    client: Client,
    url: Url,
    user: Option<String>,
    password: Option<String>,
    next_id: AtomicU64,
    policies: RpcPolicies,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Create a new RPC client
    pub fn new(
        url: impl AsRef<str>,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
        insecure: bool,
    ) -> Result<Self> {
        let url = Url::parse(url.as_ref())
            .map_err(|e| Error::config(format!("Invalid node URL: {}", e)))?;

        let client = ClientBuilder::new()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            client,
            url,
            user,
            password,
            next_id: AtomicU64::new(1),
            policies: RpcPolicies::default(),
        })
    }

    /// Override the per-call retry policies
    pub fn with_policies(mut self, policies: RpcPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Issue one RPC call and decode its result
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(self.url.clone()).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }

        debug!("RPC {} (id {})", method, id);
        let response = request.send().await.map_err(Error::from)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(Error::from)?;

        match parse_response(&bytes) {
            Ok(result) => serde_json::from_value(result).map_err(Error::from),
            Err(Error::Json(_)) if !status.is_success() => Err(Error::network(format!(
                "{} failed: HTTP {}",
                method, status
            ))),
            Err(e) => Err(e),
        }
    }
}

/// Split a JSON-RPC response body into its result or error
pub fn parse_response(body: &[u8]) -> Result<Value> {
    let response: RpcResponse = serde_json::from_slice(body)?;
    match response.error {
        Some(error) => Err(Error::rpc(error.code, error.message)),
        None => Ok(response.result),
    }
}

/// `submitblock` answers `null` on acceptance and a reason string otherwise
pub fn interpret_submit_result(result: &Value) -> std::result::Result<(), String> {
    match result {
        Value::Null => Ok(()),
        Value::String(reason) if reason.is_empty() => Ok(()),
        Value::String(reason) => Err(reason.clone()),
        other => Err(other.to_string()),
    }
}

#[async_trait]
impl ChainNode for RpcClient {
    #[instrument(skip(self))]
    async fn get_block_template(&self) -> Result<BlockTemplate> {
        self.policies
            .template
            .execute(|| self.call("getblocktemplate", json!([{"rules": ["segwit"]}])))
            .await
    }

    #[instrument(skip(self, block_hex), fields(bytes = block_hex.len() / 2))]
    async fn submit_block(&self, block_hex: &str) -> Result<bool> {
        let result: Value = self
            .policies
            .submit
            .execute(|| self.call("submitblock", json!([block_hex])))
            .await?;

        match interpret_submit_result(&result) {
            Ok(()) => Ok(true),
            Err(reason) => {
                warn!("Node rejected block: {}", reason);
                Ok(false)
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_block_header(&self, hash: &Hash256) -> Result<HeaderStatus> {
        let result: Result<Value> = self
            .policies
            .header
            .execute(|| self.call("getblockheader", json!([hash.to_hex_be(), true])))
            .await;

        match result {
            Ok(header) => {
                let confirmations = header
                    .get("confirmations")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| Error::rpc(0, "getblockheader: missing confirmations"))?;
                Ok(HeaderStatus::Confirmations(confirmations))
            }
            Err(Error::Rpc { code, .. }) if code == RPC_INVALID_ADDRESS_OR_KEY => {
                Ok(HeaderStatus::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn validate_address(&self, address: &str) -> Result<AddressInfo> {
        self.policies
            .address
            .execute(|| self.call("validateaddress", json!([address])))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_client_creation() {
        let client = RpcClient::new(
            "http://127.0.0.1:8332",
            Some("user".into()),
            Some("pass".into()),
            Duration::from_secs(10),
            false,
        );
        assert!(client.is_ok());

        let client = RpcClient::new("not a url", None, None, Duration::from_secs(10), false);
        assert_matches!(client, Err(Error::Config { .. }));
    }

    #[test]
    fn test_parse_response_result() {
        let body = br#"{"result": {"confirmations": 12}, "error": null, "id": 1}"#;
        let value = parse_response(body).unwrap();
        assert_eq!(value["confirmations"], 12);
    }

    #[test]
    fn test_parse_response_error() {
        let body = br#"{"result": null, "error": {"code": -5, "message": "Block not found"}, "id": 2}"#;
        assert_matches!(
            parse_response(body),
            Err(Error::Rpc { code: -5, .. })
        );
    }

    #[test]
    fn test_parse_response_garbage() {
        assert_matches!(parse_response(b"<html>502</html>"), Err(Error::Json(_)));
    }

    #[test]
    fn test_submit_result_interpretation() {
        assert!(interpret_submit_result(&Value::Null).is_ok());
        assert_eq!(
            interpret_submit_result(&json!("high-hash")),
            Err("high-hash".to_string())
        );
        assert!(interpret_submit_result(&json!("duplicate")).is_err());
    }
}
