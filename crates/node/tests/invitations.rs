//! Integration tests for joining spaces and identities through invitations

mod common;

use std::sync::Arc;

use ::common::credentials::SpaceRole;
use ::common::invitation::{AuthMethod, InvitationError, InvitationState, StaticSecret};
use node::testkit::TestNetwork;
use node::NodeError;

use crate::common::{setup_tracing, TIMEOUT};

#[tokio::test]
async fn test_wrong_code_fails_the_guest() -> anyhow::Result<()> {
    setup_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice").await?;
    let bob = net.add_peer("bob").await?;
    let space = alice.create_space().await?;
    bob.node().create_identity().await?;

    let hosted = alice
        .node()
        .share_space(&space.key(), SpaceRole::Editor, AuthMethod::SharedSecret)
        .await?;
    let wrong = match hosted.auth_code() {
        Some("000000") => "111111",
        _ => "000000",
    };
    let pending = bob
        .node()
        .accept_invitation(&hosted.encoded()?, Arc::new(StaticSecret::new(wrong)))
        .await?;
    let feed_key = pending.feed_key();
    assert!(bob.node().keyring().contains(&feed_key));

    assert!(matches!(
        tokio::time::timeout(TIMEOUT, pending.join()).await?,
        Err(NodeError::Invitation(InvitationError::InvalidCode))
    ));
    assert!(!bob.node().keyring().contains(&feed_key));
    assert!(bob.node().space(&space.key()).await.is_none());
    assert_eq!(space.members().await?.len(), 1);

    hosted.cancel();
    assert!(matches!(
        hosted.wait().await,
        Err(InvitationError::Cancelled)
    ));
    assert_eq!(hosted.state(), InvitationState::Cancelled);

    net.shutdown().await
}

#[tokio::test]
async fn test_open_invitation_admits_member() -> anyhow::Result<()> {
    setup_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice").await?;
    let bob = net.add_peer("bob").await?;
    let space = alice.create_space().await?;
    let bob_identity = bob.node().create_identity().await?.key();

    let hosted = alice
        .node()
        .share_space(&space.key(), SpaceRole::Editor, AuthMethod::None)
        .await?;
    assert!(hosted.auth_code().is_none());
    let pending = bob
        .node()
        .accept_invitation(&hosted.encoded()?, Arc::new(StaticSecret::new("")))
        .await?;
    let feed_key = pending.feed_key();
    let shared = pending.join().await?;
    shared.wait_until_writable(TIMEOUT).await?;
    assert!(bob.node().keyring().contains(&feed_key));

    let keys = bob.node().keyring().public_keys();
    assert!(space
        .members()
        .await?
        .iter()
        .any(|(identity, _)| *identity == bob_identity));
    assert!(matches!(
        bob.node()
            .accept_invitation(&hosted.encoded()?, Arc::new(StaticSecret::new("")))
            .await,
        Err(NodeError::SpaceExists(_))
    ));
    assert_eq!(bob.node().keyring().public_keys(), keys);

    net.shutdown().await
}

#[tokio::test]
async fn test_abandoned_join_releases_feed_key() -> anyhow::Result<()> {
    setup_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice").await?;
    let bob = net.add_peer("bob").await?;
    let space = alice.create_space().await?;
    bob.node().create_identity().await?;
    let keys = bob.node().keyring().public_keys();

    let hosted = alice
        .node()
        .share_space(&space.key(), SpaceRole::Reader, AuthMethod::SharedSecret)
        .await?;
    let pending = bob
        .node()
        .accept_invitation(&hosted.encoded()?, Arc::new(StaticSecret::new("")))
        .await?;
    let feed_key = pending.feed_key();
    pending.handle().cancel();
    drop(pending);

    assert!(!bob.node().keyring().contains(&feed_key));
    assert_eq!(bob.node().keyring().public_keys(), keys);
    assert!(bob.node().space(&space.key()).await.is_none());

    hosted.cancel();
    net.shutdown().await
}

#[tokio::test]
async fn test_new_device_joins_identity() -> anyhow::Result<()> {
    setup_tracing();
    let mut net = TestNetwork::new();
    let laptop = net.add_peer("laptop").await?;
    let phone = net.add_peer("phone").await?;
    let identity = laptop.node().create_identity().await?;

    let hosted = laptop
        .node()
        .share_identity(AuthMethod::SharedSecret)
        .await?;
    let code = hosted.auth_code().unwrap_or_default().to_string();
    let pending = phone
        .node()
        .accept_invitation(&hosted.encoded()?, Arc::new(StaticSecret::new(code)))
        .await?;
    let joined = pending.join().await?;
    hosted.wait().await?;

    assert_eq!(joined.key(), identity.key());
    let chain = joined.wait_for_device_chain(TIMEOUT).await?;
    assert_eq!(chain.subject, phone.device_key());
    joined.wait_until_writable(TIMEOUT).await?;

    // the new device acts for the identity in spaces of its own
    let space = phone.node().create_space().await?;
    assert!(space
        .members()
        .await?
        .iter()
        .any(|(member, _)| *member == identity.key()));

    net.shutdown().await
}
