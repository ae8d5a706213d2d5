#![allow(dead_code)]

use crawler_common::{db, BlockRange};
use crawler_indexer::retry::RetryPolicy;
use crawler_indexer::{AmountUnit, CrawlSettings, Crawler, RpcClient, StorageWriter};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const FAST_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));

pub const GENESIS_TS: u64 = 1_700_000_000;

/// How the fake node answers `eth_getBlockByNumber` for one block
#[derive(Debug, Clone)]
pub enum Script {
    Block(Value),
    /// `null` for the first `misses` requests, then the block
    NotYet { misses: u32, block: Value },
    /// Always `null`
    Missing,
    /// HTTP 503
    Unavailable,
    /// HTTP 200 with a body that is not JSON
    Garbage,
    /// JSON-RPC error object with the given code
    RpcError(i64),
    Slow { delay: Duration, block: Value },
}

#[derive(Default)]
struct NodeState {
    head: u64,
    down: bool,
    blocks: HashMap<u64, Script>,
    block_calls: HashMap<u64, u32>,
    head_calls: u32,
}

/// Scripted JSON-RPC node served by wiremock
#[derive(Clone, Default)]
pub struct FakeNode {
    state: Arc<Mutex<NodeState>>,
}

impl FakeNode {
    pub fn new(head: u64) -> Self {
        let node = Self::default();
        node.state.lock().unwrap().head = head;
        node
    }

    pub fn with(self, number: u64, script: Script) -> Self {
        self.state.lock().unwrap().blocks.insert(number, script);
        self
    }

    /// Standard block with `tx_count` transactions of `wei` each
    pub fn with_block(self, number: u64, tx_count: u64, wei: u64) -> Self {
        let txs = (0..tx_count).map(|i| tx(number * 1_000 + i, number, wei)).collect();
        self.with(number, Script::Block(block(number, GENESIS_TS + number * 12, txs)))
    }

    /// Every endpoint answers 503
    pub fn down(self) -> Self {
        self.state.lock().unwrap().down = true;
        self
    }

    pub fn block_calls(&self, number: u64) -> u32 {
        self.state.lock().unwrap().block_calls.get(&number).copied().unwrap_or(0)
    }

    pub fn total_block_calls(&self) -> u32 {
        self.state.lock().unwrap().block_calls.values().sum()
    }

    pub fn head_calls(&self) -> u32 {
        self.state.lock().unwrap().head_calls
    }

    pub async fn start(&self) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(self.clone())
            .mount(&server)
            .await;
        server
    }
}

impl Respond for FakeNode {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(_) => return ResponseTemplate::new(400),
        };
        let id = body["id"].clone();
        let mut state = self.state.lock().unwrap();

        if state.down {
            return ResponseTemplate::new(503);
        }

        match body["method"].as_str() {
            Some("eth_blockNumber") => {
                state.head_calls += 1;
                rpc_result(id, json!(format!("0x{:x}", state.head)))
            }
            Some("eth_getBlockByNumber") => {
                let number = body["params"][0]
                    .as_str()
                    .and_then(|s| s.strip_prefix("0x"))
                    .and_then(|s| u64::from_str_radix(s, 16).ok())
                    .unwrap_or(u64::MAX);

                let calls = state.block_calls.entry(number).or_insert(0);
                *calls += 1;
                let calls = *calls;

                match state.blocks.get(&number).cloned().unwrap_or(Script::Missing) {
                    Script::Block(block) => rpc_result(id, block),
                    Script::NotYet { misses, block } => {
                        if calls <= misses {
                            rpc_result(id, Value::Null)
                        } else {
                            rpc_result(id, block)
                        }
                    }
                    Script::Missing => rpc_result(id, Value::Null),
                    Script::Unavailable => ResponseTemplate::new(503),
                    Script::Garbage => ResponseTemplate::new(200).set_body_string("<html>bad gateway</html>"),
                    Script::RpcError(code) => ResponseTemplate::new(200).set_body_json(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": code, "message": "limit exceeded" }
                    })),
                    Script::Slow { delay, block } => rpc_result(id, block).set_delay(delay),
                }
            }
            _ => ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "method not found" }
            })),
        }
    }
}

fn rpc_result(id: Value, result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

pub fn hash(id: u64) -> String {
    format!("0x{:064x}", id)
}

pub fn tx(id: u64, block: u64, wei: u64) -> Value {
    json!({
        "hash": hash(id),
        "blockNumber": format!("0x{:x}", block),
        "value": format!("0x{:x}", wei),
        "from": "0x00000000000000000000000000000000000000aa",
        "to": "0x00000000000000000000000000000000000000bb",
    })
}

pub fn block(number: u64, ts: u64, transactions: Vec<Value>) -> Value {
    json!({
        "number": format!("0x{:x}", number),
        "timestamp": format!("0x{:x}", ts),
        "hash": format!("0x{:064x}", number + 0xb10c),
        "transactions": transactions,
    })
}

pub fn client(server: &MockServer) -> RpcClient {
    let url = server.uri().parse().unwrap();
    RpcClient::new(url, NonZeroU32::new(1_000).unwrap(), Duration::from_secs(5), FAST_RETRY).unwrap()
}

pub async fn writer(dir: &tempfile::TempDir) -> StorageWriter {
    let pool = db::create_pool(&dir.path().join("crawl.db"), 2).await.unwrap();
    let writer = StorageWriter::new(pool, FAST_RETRY);
    writer.ensure_schema().await.unwrap();
    writer
}

pub fn settings(start: u64, end: u64, fetch_workers: usize) -> CrawlSettings {
    CrawlSettings {
        range: BlockRange::new(start, end).unwrap(),
        fetch_workers,
        unit: AmountUnit::Wei,
        refetch: false,
        max_consecutive_failures: 10,
    }
}

pub fn crawler(server: &MockServer, writer: &StorageWriter, settings: CrawlSettings) -> Crawler {
    Crawler::new(client(server), writer.clone(), settings)
}
