//! Chain node collaborator
//!
//! The pool talks to its node through the [`ChainNode`] trait: template
//! fetch, block submission, confirmation polling and address validation.
//! [`rpc::RpcClient`] is the JSON-RPC implementation; tests substitute
//! in-memory nodes.

pub mod retry;
pub mod rpc;

pub use retry::{RetryOn, RetryPolicy};
pub use rpc::RpcClient;

use crate::crypto::Hash256;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One candidate transaction from `getblocktemplate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateTransaction {
    /// Full serialized transaction, hex
    pub data: String,
    /// Transaction id, big-endian hex
    pub txid: String,
    /// Witness transaction id, big-endian hex; absent for legacy nodes
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub fee: i64,
    /// 1-based indices of template transactions this one spends from
    #[serde(default)]
    pub depends: Vec<usize>,
}

/// Optional commitment roots reported by Equihash-family nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRoots {
    #[serde(default, rename = "blockcommitmentshash")]
    pub block_commitments_hash: Option<String>,
}

/// Block template as returned by `getblocktemplate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub version: u32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    /// Compact target, hex
    pub bits: String,
    pub height: u64,
    #[serde(rename = "curtime")]
    pub cur_time: u64,
    #[serde(rename = "mintime", default)]
    pub min_time: u64,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(rename = "default_witness_commitment", default)]
    pub default_witness_commitment: Option<String>,
    #[serde(rename = "finalsaplingroothash", default)]
    pub final_sapling_root_hash: Option<String>,
    #[serde(rename = "defaultroots", default)]
    pub default_roots: Option<DefaultRoots>,
}

impl BlockTemplate {
    /// Parse the compact bits field
    pub fn bits_u32(&self) -> Result<u32> {
        u32::from_str_radix(&self.bits, 16)
            .map_err(|e| crate::Error::template(format!("invalid bits {}: {}", self.bits, e)))
    }

    /// Previous block hash in internal order
    pub fn prev_hash(&self) -> Result<Hash256> {
        Hash256::from_hex_be(&self.previous_block_hash)
            .map_err(|e| crate::Error::template(format!("invalid previousblockhash: {}", e)))
    }
}

/// Confirmation state of a submitted block as seen by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    /// Confirmation depth; `-1` means the block is known but off the main chain
    Confirmations(i64),
    /// The node does not know the hash at all
    NotFound,
}

/// Result of `validateaddress`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    #[serde(rename = "isvalid")]
    pub is_valid: bool,
    #[serde(rename = "scriptPubKey", default)]
    pub script_pub_key: Option<String>,
}

/// The node operations the pool depends on
///
/// Implementations must be callable from many tasks at once.
#[async_trait]
pub trait ChainNode: Send + Sync {
    async fn get_block_template(&self) -> Result<BlockTemplate>;

    /// Returns `Ok(true)` when the node accepted the block
    async fn submit_block(&self, block_hex: &str) -> Result<bool>;

    async fn get_block_header(&self, hash: &Hash256) -> Result<HeaderStatus>;

    async fn validate_address(&self, address: &str) -> Result<AddressInfo>;
}
