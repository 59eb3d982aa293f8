//! Shared fixtures: an in-memory node, a running pool and a line client

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stratum_pool::chain::{AddressInfo, BlockTemplate, ChainNode, HeaderStatus};
use stratum_pool::crypto::{sha256d, Hash256, Sha256d};
use stratum_pool::store::MemoryStore;
use stratum_pool::utils::current_timestamp_secs;
use stratum_pool::{Config, Error, Pool, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const PAYOUT_SCRIPT: &str = "0014751e76e8199196d454941c45d1b3a323f1433bd6";

/// Compact bits of difficulty 1; shares at tiny session difficulty never reach it
pub const HARD_BITS: &str = "1d00ffff";
/// Regtest bits; roughly every other share is a block
pub const EASY_BITS: &str = "207fffff";

/// Node that serves one scripted template and records submissions
pub struct MemoryNode {
    template: Mutex<BlockTemplate>,
    submitted: Mutex<Vec<Hash256>>,
    confirmations: Mutex<HashMap<Hash256, i64>>,
}

impl MemoryNode {
    pub fn new(bits: &str) -> Self {
        Self {
            template: Mutex::new(template(840_000, bits)),
            submitted: Mutex::new(Vec::new()),
            confirmations: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_template(&self, template: BlockTemplate) {
        *self.template.lock() = template;
    }

    pub fn submitted(&self) -> Vec<Hash256> {
        self.submitted.lock().clone()
    }

    pub fn confirm(&self, hash: Hash256, depth: i64) {
        self.confirmations.lock().insert(hash, depth);
    }
}

#[async_trait]
impl ChainNode for MemoryNode {
    async fn get_block_template(&self) -> Result<BlockTemplate> {
        Ok(self.template.lock().clone())
    }

    /// Accepts only the first block, like a node that has moved on
    async fn submit_block(&self, block_hex: &str) -> Result<bool> {
        let bytes = hex::decode(block_hex).map_err(|e| Error::encoding(e.to_string()))?;
        let hash = sha256d(&bytes[..80]);
        let mut submitted = self.submitted.lock();
        submitted.push(hash);
        Ok(submitted.len() == 1)
    }

    async fn get_block_header(&self, hash: &Hash256) -> Result<HeaderStatus> {
        Ok(match self.confirmations.lock().get(hash) {
            Some(depth) => HeaderStatus::Confirmations(*depth),
            None => HeaderStatus::NotFound,
        })
    }

    async fn validate_address(&self, address: &str) -> Result<AddressInfo> {
        Ok(AddressInfo {
            is_valid: address.starts_with("tb1"),
            script_pub_key: Some(PAYOUT_SCRIPT.to_string()),
        })
    }
}

pub fn template(height: u64, bits: &str) -> BlockTemplate {
    let now = current_timestamp_secs();
    serde_json::from_value(json!({
        "version": 0x2000_0000u32,
        "previousblockhash": format!("{:064x}", height - 1),
        "bits": bits,
        "height": height,
        "curtime": now,
        "mintime": now - 600,
        "coinbasevalue": 312_500_000u64,
        "transactions": [],
    }))
    .unwrap()
}

pub fn config(extra: &[&str]) -> Config {
    let mut args = vec![
        "stratum-pool",
        "--payout-address",
        "tb1qpool",
        "--initial-difficulty",
        "1e-10",
        "--min-difficulty",
        "1e-10",
        "--template-refresh",
        "1h",
        "--stats-interval",
        "1h",
        "--maturity-interval",
        "1h",
        "--maturity-depth",
        "10",
    ];
    args.extend_from_slice(extra);
    Config::try_parse_from(args).unwrap()
}

/// A pool serving on ephemeral loopback ports
pub struct TestPool {
    pub pool: Arc<Pool>,
    pub node: Arc<MemoryNode>,
    pub store: Arc<MemoryStore>,
    pub stratum_addr: SocketAddr,
    pub control_addr: SocketAddr,
    pub shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl TestPool {
    pub async fn start(bits: &str, extra: &[&str]) -> Self {
        let node = Arc::new(MemoryNode::new(bits));
        let store = Arc::new(MemoryStore::default());
        let pool = Arc::new(
            Pool::new(config(extra), node.clone(), store.clone(), Arc::new(Sha256d))
                .await
                .unwrap(),
        );

        let stratum = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stratum_addr = stratum.local_addr().unwrap();
        let control_addr = control.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(pool.clone().serve(stratum, control, shutdown.clone()));

        Self {
            pool,
            node,
            store,
            stratum_addr,
            control_addr,
            shutdown,
            task,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
    }
}

/// Newline-delimited JSON client
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
            next_id: 1,
        }
    }

    /// Send a request and return its id
    pub async fn send(&mut self, method: &str, params: Value) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let line = json!({"id": id, "method": method, "params": params}).to_string();
        self.send_raw(&line).await;
        id
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    pub async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let read = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        assert!(read > 0, "connection closed");
        serde_json::from_str(&line).unwrap()
    }

    /// Next message carrying `method`, skipping others
    pub async fn recv_method(&mut self, method: &str) -> Value {
        loop {
            let message = self.recv().await;
            if message["method"] == json!(method) {
                return message;
            }
        }
    }

    pub async fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.send(method, params).await;
        let response = self.recv().await;
        assert_eq!(response["id"], json!(id));
        response
    }

    /// Subscribe and authorize; returns the first notify
    pub async fn login(&mut self, username: &str) -> Value {
        let subscribed = self.call("mining.subscribe", json!(["test-miner/1.0"])).await;
        assert!(subscribed["error"].is_null());
        let authorized = self.call("mining.authorize", json!([username, "x"])).await;
        assert_eq!(authorized["result"], json!(true));
        let difficulty = self.recv().await;
        assert_eq!(difficulty["method"], json!("mining.set_difficulty"));
        let notify = self.recv().await;
        assert_eq!(notify["method"], json!("mining.notify"));
        notify
    }
}

/// Submit params for a Bitcoin-family notify
pub fn submit_params(username: &str, notify: &Value, extranonce2: u32) -> Value {
    let params = &notify["params"];
    json!([
        username,
        params[0],
        format!("{:08x}", extranonce2),
        params[7],
        "00000000"
    ])
}
