mod common;

use common::{block, client, tx, FakeNode, Script, GENESIS_TS};
use crawler_common::CrawlerError;

#[tokio::test]
async fn fetches_block_with_full_transactions() {
    let node = FakeNode::new(100).with_block(7, 3, 250);
    let server = node.start().await;

    let raw = client(&server).fetch_block(7).await.unwrap();

    assert_eq!(raw.number.as_deref(), Some("0x7"));
    assert_eq!(raw.transactions.as_ref().map(Vec::len), Some(3));
    assert_eq!(node.block_calls(7), 1);
}

#[tokio::test]
async fn reports_chain_head() {
    let node = FakeNode::new(0x1b4);
    let server = node.start().await;

    assert_eq!(client(&server).block_number().await.unwrap(), 436);
    assert_eq!(node.head_calls(), 1);
}

#[tokio::test]
async fn not_yet_available_block_is_retried() {
    let node = FakeNode::new(100).with(
        9,
        Script::NotYet {
            misses: 2,
            block: block(9, GENESIS_TS, vec![tx(1, 9, 5)]),
        },
    );
    let server = node.start().await;

    let raw = client(&server).fetch_block(9).await.unwrap();

    assert_eq!(raw.transactions.unwrap().len(), 1);
    assert_eq!(node.block_calls(9), 3);
}

#[tokio::test]
async fn missing_block_fails_after_all_attempts() {
    let node = FakeNode::new(100);
    let server = node.start().await;

    let err = client(&server).fetch_block(50).await.unwrap_err();

    assert!(matches!(err, CrawlerError::NotFound(50)), "{:?}", err);
    assert_eq!(node.block_calls(50), common::FAST_RETRY.max_attempts);
}

#[tokio::test]
async fn malformed_response_is_not_retried() {
    let node = FakeNode::new(100).with(3, Script::Garbage);
    let server = node.start().await;

    let err = client(&server).fetch_block(3).await.unwrap_err();

    assert!(matches!(err, CrawlerError::MalformedResponse(_)), "{:?}", err);
    assert_eq!(node.block_calls(3), 1);
}

#[tokio::test]
async fn undecodable_block_is_malformed() {
    // Hash-only transaction lists mean the node ignored the full-objects flag
    let node = FakeNode::new(100).with(
        4,
        Script::Block(serde_json::json!({
            "number": "0x4",
            "timestamp": "0x1",
            "transactions": ["0xaaaa"]
        })),
    );
    let server = node.start().await;

    let err = client(&server).fetch_block(4).await.unwrap_err();
    assert!(matches!(err, CrawlerError::MalformedResponse(_)), "{:?}", err);
    assert_eq!(node.block_calls(4), 1);
}

#[tokio::test]
async fn unavailable_node_exhausts_retries() {
    let node = FakeNode::new(100).with(5, Script::Unavailable);
    let server = node.start().await;

    let err = client(&server).fetch_block(5).await.unwrap_err();

    assert!(matches!(err, CrawlerError::Network(_)), "{:?}", err);
    assert_eq!(node.block_calls(5), common::FAST_RETRY.max_attempts);
}

#[tokio::test]
async fn rpc_error_object_is_retried_as_network_error() {
    let node = FakeNode::new(100).with(6, Script::RpcError(-32005));
    let server = node.start().await;

    let err = client(&server).fetch_block(6).await.unwrap_err();

    assert!(matches!(err, CrawlerError::Network(ref msg) if msg.contains("limit exceeded")), "{:?}", err);
    assert_eq!(node.block_calls(6), common::FAST_RETRY.max_attempts);
}

#[tokio::test]
async fn invalid_params_error_is_not_retried() {
    let node = FakeNode::new(100).with(8, Script::RpcError(-32602));
    let server = node.start().await;

    let err = client(&server).fetch_block(8).await.unwrap_err();

    assert!(matches!(err, CrawlerError::MalformedResponse(_)), "{:?}", err);
    assert_eq!(node.block_calls(8), 1);
}

#[tokio::test]
async fn unreachable_endpoint_is_network_error() {
    let server = wiremock::MockServer::start().await;
    let rpc = client(&server);
    drop(server);

    let err = rpc.block_number().await.unwrap_err();
    assert!(matches!(err, CrawlerError::Network(_)), "{:?}", err);
}
