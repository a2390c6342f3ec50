/// Lightweight test harness for multi-node integration tests
///
/// This module provides a simple way to create and test multiple nodes
/// replicating spaces with each other in-process, over the in-memory
/// network, without requiring external infrastructure.
///
/// # Example
///
/// ```rust,ignore
/// use node::testkit::TestNetwork;
///
/// #[tokio::test]
/// async fn test_space_sync() -> anyhow::Result<()> {
///     let mut net = TestNetwork::new();
///     let alice = net.add_peer("alice").await?;
///     let bob = net.add_peer("bob").await?;
///
///     let space = alice.create_space().await?;
///     alice.set(&space, "title", "Hello").await?;
///     let shared = bob.join_space_of(&alice, &space.key()).await?;
///
///     net.eventually(Duration::from_secs(5), || async {
///         Ok(shared.get("title").await?.is_some())
///     }).await?;
///
///     net.shutdown().await?;
///     Ok(())
/// }
/// ```
mod network;
mod peer;

pub use network::TestNetwork;
pub use peer::TestPeer;
