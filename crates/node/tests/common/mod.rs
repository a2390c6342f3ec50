#![allow(dead_code)]

use std::time::Duration;

use ::common::space::Space;
use node::testkit::{TestNetwork, TestPeer};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Route test logs through the test writer; repeated calls are fine
pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with_test_writer()
        .try_init();
}

/// Two peers where bob has joined a space alice created
pub async fn shared_space() -> anyhow::Result<(TestNetwork, TestPeer, TestPeer, Space, Space)> {
    setup_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice").await?;
    let bob = net.add_peer("bob").await?;
    let alice_space = alice.create_space().await?;
    let bob_space = bob.join_space_of(&alice, &alice_space.key()).await?;
    Ok((net, alice, bob, alice_space, bob_space))
}

/// Wait until both spaces have processed everything the other has
pub async fn converge(net: &TestNetwork, a: &Space, b: &Space) -> anyhow::Result<()> {
    net.eventually(TIMEOUT, || async {
        Ok(a.timeframe() == b.timeframe() && a.document().await? == b.document().await?)
    })
    .await
}
