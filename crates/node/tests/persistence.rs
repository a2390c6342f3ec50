//! Integration tests for nodes surviving a restart

mod common;

use serde_json::json;
use tempfile::TempDir;

use crate::common::{setup_tracing, TIMEOUT};
use node::testkit::{TestNetwork, TestPeer};
use node::{Node, NodeConfig};

#[tokio::test]
async fn test_restart_replays_spaces() -> anyhow::Result<()> {
    setup_tracing();
    let temp = TempDir::new()?;
    let mut net = TestNetwork::new();
    let alice = net
        .add_peer_at("alice", Some(temp.path().to_path_buf()))
        .await?;

    let space = alice.create_space().await?;
    alice.set(&space, "title", "Hello").await?;
    alice.set(&space, "count", 2i64).await?;
    let identity = alice.node().identity().await.unwrap().key();
    let device = alice.device_key();
    let timeframe = space.timeframe();
    net.remove_peer("alice").await?;

    let reopened = Node::open(TestPeer::config(Some(temp.path().to_path_buf())), net.network()).await?;
    assert_eq!(reopened.device_key(), device);
    assert_eq!(reopened.identity().await.unwrap().key(), identity);

    let space = reopened.space(&space.key()).await.unwrap();
    space.wait_for_timeframe(&timeframe, TIMEOUT).await?;
    assert_eq!(space.document().await?, json!({ "title": "Hello", "count": 2 }));
    space.wait_until_writable(TIMEOUT).await?;
    space.write(::common::space::Mutation::set("title", "Again")).await?;
    assert_eq!(space.get("title").await?, Some("Again".into()));

    reopened.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_config_written_next_to_data() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let config = NodeConfig::load_or_init(temp.path())?;
    let network = ::common::network::MemoryNetwork::new();
    let node = Node::open(config, &network).await?;

    assert!(temp.path().join(node::config::CONFIG_FILE_NAME).exists());
    assert!(temp.path().join(node::config::KEY_FILE_NAME).exists());
    assert!(node.identity().await.is_none());
    node.close().await?;
    Ok(())
}
