//! Drive a whole miner session against a running daemon over TCP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use ghostpool::api_client::Client;
use ghostpool::config::Config;
use ghostpool::daemon::Daemon;
use ghostpool::error::{Error, Result};
use ghostpool::node::{BlockInfo, NodeClient, SubmitReport};
use ghostpool::template::{BlockHeader, BlockTemplate, Hash};

const ADDRESS: &str = "kaspa:qqqsyqcyq5rqwzqfpg9scrgwpugpzysnzs23v9ccrydpk8qarc0jqsxdsp6jf";

/// Serves one fixed template whose network target no share can meet.
struct StaticNode;

#[async_trait]
impl NodeClient for StaticNode {
    async fn block_template(&self) -> Result<BlockTemplate> {
        Ok(BlockTemplate {
            header: BlockHeader {
                version: 1,
                parents_by_level: vec![vec![Hash::from_bytes([0xaa; 32])]],
                hash_merkle_root: Hash::from_bytes([0x11; 32]),
                accepted_id_merkle_root: Hash::from_bytes([0x22; 32]),
                utxo_commitment: Hash::from_bytes([0x33; 32]),
                timestamp: 1_700_000_000_000,
                bits: 0x1000_ffff,
                nonce: 0,
                daa_score: 1000,
                blue_work: "1e240".parse().unwrap(),
                blue_score: 900,
                pruning_point: Hash::from_bytes([0x44; 32]),
            },
            transactions: Vec::new(),
        })
    }

    async fn submit_block(&self, _block: &BlockTemplate) -> Result<SubmitReport> {
        Ok(SubmitReport::Success)
    }

    async fn block_info(&self, txn_id: &str) -> Result<BlockInfo> {
        Err(Error::Node(format!("unknown transaction {txn_id}")))
    }
}

struct Miner {
    stream: BufReader<TcpStream>,
}

impl Miner {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        Self {
            stream: BufReader::new(TcpStream::connect(addr).await.unwrap()),
        }
    }

    async fn send(&mut self, request: Value) {
        let mut line = request.to_string();
        line.push('\n');
        self.stream.get_mut().write_all(line.as_bytes()).await.unwrap();
    }

    async fn next(&mut self) -> Value {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.stream.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Read lines until the response to `id`, returning it and everything
    /// seen before it.
    async fn until_response(&mut self, id: u64) -> (Value, Vec<Value>) {
        let mut before = Vec::new();
        loop {
            let line = self.next().await;
            if line["id"] == json!(id) {
                return (line, before);
            }
            before.push(line);
        }
    }

    async fn until_notify(&mut self) -> Value {
        loop {
            let line = self.next().await;
            if line["method"] == "mining.notify" {
                return line;
            }
        }
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.treasury.address = ADDRESS.into();
    config.node.poll_interval_ms = 20;
    config.stratum.listen = "127.0.0.1:0".parse().unwrap();
    config.stratum.difficulty = 1e-12;
    config.stratum.min_difficulty = 1e-12;
    config.api.listen = "127.0.0.1:0".parse().unwrap();
    config
}

#[tokio::test]
async fn test_subscribe_authorize_submit() {
    let config = config();
    config.validate().unwrap();
    let daemon = Daemon::with_node(config, Arc::new(StaticNode));
    let listening = daemon.start().await.unwrap();
    let mut miner = Miner::connect(listening.stratum).await;

    miner
        .send(json!({"id": 1, "method": "mining.subscribe", "params": ["lolMiner 1.8"]}))
        .await;
    let (subscribed, _) = miner.until_response(1).await;
    assert_eq!(subscribed["result"], json!([true, "EthereumStratum/1.0.0"]));

    let notify = miner.until_notify().await;
    let job_id = notify["params"][0].as_str().unwrap().to_string();
    // Generic encoding: pre-PoW hash and timestamp as one hex string
    assert_eq!(notify["params"][1].as_str().unwrap().len(), 80);

    miner
        .send(json!({"id": 2, "method": "mining.authorize", "params": [format!("{ADDRESS}.rig"), "x"]}))
        .await;
    let (authorized, pushed) = miner.until_response(2).await;
    assert_eq!(authorized["result"], true);
    let methods: Vec<&str> = pushed
        .iter()
        .filter_map(|line| line["method"].as_str())
        .filter(|m| *m != "mining.notify")
        .collect();
    assert_eq!(methods, ["mining.set_extranonce", "mining.set_difficulty"]);

    let submit = json!({
        "id": 3,
        "method": "mining.submit",
        "params": [format!("{ADDRESS}.rig"), job_id, "00000000000000ff"]
    });
    miner.send(submit.clone()).await;
    let (accepted, _) = miner.until_response(3).await;
    assert_eq!(accepted, json!({"id": 3, "result": true, "error": null}));

    miner.send(submit).await;
    let (duplicate, _) = miner.until_response(3).await;
    assert_eq!(duplicate["result"], false);
    assert_eq!(duplicate["error"], json!([22, "Duplicate share", null]));

    miner
        .send(json!({"id": 4, "method": "mining.submit", "params": [format!("{ADDRESS}.rig"), "999", "01"]}))
        .await;
    let (missing, _) = miner.until_response(4).await;
    assert_eq!(missing["error"][0], 21);

    let client = Client::new(&format!("http://{}", listening.api)).unwrap();
    let stats = client.stats().await.unwrap();
    assert_eq!(stats.connections, 1);
    let worker = stats.workers.iter().find(|w| w.worker == "rig").unwrap();
    assert_eq!(worker.address, ADDRESS);
    assert_eq!(worker.shares, 1);
    assert_eq!(worker.duplicate, 1);
    assert_eq!(worker.jobs_not_found, 1);
    assert_eq!(stats.pending_contributions, 1);

    tokio::time::timeout(Duration::from_secs(5), daemon.stop())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unknown_method_keeps_connection() {
    let daemon = Daemon::with_node(config(), Arc::new(StaticNode));
    let listening = daemon.start().await.unwrap();
    let mut miner = Miner::connect(listening.stratum).await;

    miner
        .send(json!({"id": 9, "method": "mining.bogus", "params": []}))
        .await;
    let (unknown, _) = miner.until_response(9).await;
    assert_eq!(unknown["error"], json!([20, "Unknown method", null]));

    miner
        .send(json!({"id": 10, "method": "mining.extranonce.subscribe", "params": []}))
        .await;
    let (ok, _) = miner.until_response(10).await;
    assert_eq!(ok["result"], true);

    daemon.stop().await;
}
