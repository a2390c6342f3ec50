use proptest::prelude::*;
use test_strategy::proptest;

use super::*;
use crate::credentials::{Assertion, Credential, SpaceRole};
use crate::crypto::{Keyring, PublicKey, SecretKey};
use crate::feed::{BlockHash, FeedBlock};
use crate::timeframe::Timeframe;

struct Writer {
    secret: SecretKey,
    prev: BlockHash,
    blocks: Vec<FeedBlock>,
}

impl Writer {
    fn new() -> Self {
        Self {
            secret: SecretKey::generate(),
            prev: BlockHash::ZERO,
            blocks: Vec::new(),
        }
    }

    fn key(&self) -> PublicKey {
        self.secret.public()
    }

    fn write(&mut self, timeframe: &Timeframe, payload: Payload) -> FeedBlock {
        let message = SpaceMessage {
            timeframe: timeframe.clone(),
            payload,
        };
        self.raw(message.encode().unwrap())
    }

    fn raw(&mut self, bytes: Vec<u8>) -> FeedBlock {
        let block = FeedBlock::sign(&self.secret, self.blocks.len() as u64, self.prev, bytes);
        self.prev = block.hash();
        self.blocks.push(block.clone());
        block
    }
}

struct Principal {
    identity: PublicKey,
    device: PublicKey,
    chain: Credential,
}

impl Principal {
    fn new(keyring: &Keyring) -> Self {
        let identity = keyring.generate();
        let device = keyring.generate();
        let chain = Credential::issue(
            keyring,
            &identity,
            identity,
            device,
            Assertion::AuthorizedDevice {
                identity_key: identity,
                device_key: device,
            },
            None,
        )
        .unwrap();
        Self {
            identity,
            device,
            chain,
        }
    }

    fn issue(&self, keyring: &Keyring, subject: PublicKey, assertion: Assertion) -> Payload {
        Payload::Credential(
            Credential::issue(
                keyring,
                &self.device,
                self.identity,
                subject,
                assertion,
                Some(self.chain.clone()),
            )
            .unwrap(),
        )
    }
}

/// Two writers, alice (the creator) and bob, with one concurrent write,
/// a late revocation of bob, and a mutation bob writes after it
struct Scenario {
    space_key: PublicKey,
    alice_feed: PublicKey,
    bob_feed: PublicKey,
    feeds: [Vec<FeedBlock>; 2],
    /// Every block in the order it was written
    written: Vec<FeedBlock>,
    digest: [u8; 32],
    timeframe: Timeframe,
}

impl Scenario {
    fn build() -> Self {
        let keyring = Keyring::new();
        let alice = Principal::new(&keyring);
        let bob = Principal::new(&keyring);
        let space_key = keyring.generate();
        let mut a = Writer::new();
        let mut b = Writer::new();

        let mut reference = Pipeline::new(space_key);
        reference.add_feed(a.key()).unwrap();
        reference.add_feed(b.key()).unwrap();
        let mut written = Vec::new();
        let mut step = |reference: &mut Pipeline, block: FeedBlock| {
            written.push(block.clone());
            reference.ingest(block).unwrap();
        };

        let genesis = Credential::issue(
            &keyring,
            &space_key,
            space_key,
            space_key,
            Assertion::SpaceGenesis,
            None,
        )
        .unwrap();
        let admin = Credential::issue(
            &keyring,
            &space_key,
            space_key,
            alice.identity,
            Assertion::SpaceMember {
                space_key,
                role: SpaceRole::Admin,
            },
            None,
        )
        .unwrap();
        let alice_admission = alice.issue(
            &keyring,
            a.key(),
            Assertion::AdmittedFeed {
                space_key,
                identity_key: alice.identity,
                device_key: alice.device,
            },
        );
        let bob_member = alice.issue(
            &keyring,
            bob.identity,
            Assertion::SpaceMember {
                space_key,
                role: SpaceRole::Editor,
            },
        );
        let bob_admission = bob.issue(
            &keyring,
            b.key(),
            Assertion::AdmittedFeed {
                space_key,
                identity_key: bob.identity,
                device_key: bob.device,
            },
        );
        let revoke_bob = alice.issue(&keyring, bob.identity, Assertion::RevokeMember { space_key });

        let payloads = [
            Payload::Credential(genesis),
            Payload::Credential(admin),
            alice_admission,
            Payload::Mutation(Mutation::set("title", "Hello")),
            bob_member,
        ];
        for payload in payloads {
            let block = a.write(reference.timeframe(), payload);
            step(&mut reference, block);
        }
        let alice_view = reference.timeframe().clone();

        let block = b.write(reference.timeframe(), bob_admission);
        step(&mut reference, block);
        let block = b.write(reference.timeframe(), Payload::Mutation(Mutation::set("body", "x")));
        step(&mut reference, block);
        // written without seeing any of bob's blocks
        let block = a.write(&alice_view, Payload::Mutation(Mutation::set("title", "Hi")));
        step(&mut reference, block);
        let block = b.write(reference.timeframe(), Payload::Mutation(Mutation::set("title", "Bob")));
        step(&mut reference, block);
        let block = a.write(reference.timeframe(), revoke_bob);
        step(&mut reference, block);
        let block = b.write(reference.timeframe(), Payload::Mutation(Mutation::set("title", "late")));
        step(&mut reference, block);

        assert_eq!(
            reference.model().document(),
            serde_json::json!({ "title": "Bob", "body": "x" })
        );

        Self {
            space_key,
            alice_feed: a.key(),
            bob_feed: b.key(),
            digest: reference.model().digest().unwrap(),
            timeframe: reference.timeframe().clone(),
            feeds: [a.blocks, b.blocks],
            written,
        }
    }

    fn pipeline(&self) -> Pipeline {
        let mut pipeline = Pipeline::new(self.space_key);
        pipeline.add_feed(self.alice_feed).unwrap();
        pipeline.add_feed(self.bob_feed).unwrap();
        pipeline
    }
}

#[proptest(cases = 48)]
fn test_any_delivery_order_converges(
    #[strategy(proptest::collection::vec(0..3u8, 0..40))] picks: Vec<u8>,
) {
    let scenario = Scenario::build();
    let mut pipeline = scenario.pipeline();
    let mut next = [0usize; 2];

    for pick in picks {
        match pick {
            0 | 1 => {
                let feed = pick as usize;
                if let Some(block) = scenario.feeds[feed].get(next[feed]) {
                    pipeline.ingest(block.clone()).unwrap();
                    next[feed] += 1;
                }
            }
            // redeliver the latest alice block
            _ => {
                if let Some(block) = next[0].checked_sub(1).map(|seq| &scenario.feeds[0][seq]) {
                    pipeline.ingest(block.clone()).unwrap();
                }
            }
        }
    }
    for (feed, blocks) in scenario.feeds.iter().enumerate() {
        for block in &blocks[next[feed]..] {
            pipeline.ingest(block.clone()).unwrap();
        }
    }

    prop_assert_eq!(pipeline.model().digest().unwrap(), scenario.digest);
    prop_assert_eq!(pipeline.timeframe(), &scenario.timeframe);
    prop_assert_eq!(pipeline.pending(&scenario.bob_feed), 0);
}

#[test]
fn test_late_block_triggers_rebuild() {
    let scenario = Scenario::build();
    let mut pipeline = scenario.pipeline();

    for block in &scenario.feeds[0][..5] {
        pipeline.ingest(block.clone()).unwrap();
    }
    for block in &scenario.feeds[1][..3] {
        pipeline.ingest(block.clone()).unwrap();
    }
    // alice's concurrent write orders before bob's last two
    let events = pipeline.ingest(scenario.feeds[0][5].clone()).unwrap();
    assert!(events.contains(&SpaceEvent::Rebuilt));
    assert_eq!(
        pipeline.model().document(),
        serde_json::json!({ "title": "Bob", "body": "x" })
    );
}

#[test]
fn test_revoked_member_mutations_are_dropped() {
    let scenario = Scenario::build();
    let mut pipeline = scenario.pipeline();

    let mut events = Vec::new();
    for block in &scenario.written {
        events.extend(pipeline.ingest(block.clone()).unwrap());
    }
    assert!(events.contains(&SpaceEvent::MutationDropped {
        feed_key: scenario.bob_feed,
        seq: 3,
        reason: DropReason::Unauthorized,
    }));
    // still consumed, so later messages depending on it are not blocked
    assert_eq!(pipeline.timeframe().get(&scenario.bob_feed), Some(3));
    assert_eq!(pipeline.model().get("title"), Some(&Value::from("Bob")));
}

#[test]
fn test_replay_is_idempotent() {
    let scenario = Scenario::build();
    let mut pipeline = scenario.pipeline();

    for block in &scenario.written {
        pipeline.ingest(block.clone()).unwrap();
    }
    let ordered: Vec<OrderKey> = pipeline.ordered().copied().collect();
    for block in &scenario.written {
        assert!(pipeline.ingest(block.clone()).unwrap().is_empty());
    }
    assert_eq!(pipeline.ordered().copied().collect::<Vec<_>>(), ordered);
    assert_eq!(pipeline.model().digest().unwrap(), scenario.digest);
}

#[test]
fn test_blocks_wait_for_dependencies() {
    let scenario = Scenario::build();
    let mut pipeline = scenario.pipeline();

    let events = pipeline.ingest(scenario.feeds[1][0].clone()).unwrap();
    assert!(events.is_empty());
    assert_eq!(pipeline.pending(&scenario.bob_feed), 1);
    assert_eq!(pipeline.timeframe().get(&scenario.bob_feed), None);

    for block in &scenario.feeds[0][..5] {
        pipeline.ingest(block.clone()).unwrap();
    }
    assert_eq!(pipeline.pending(&scenario.bob_feed), 0);
    assert_eq!(pipeline.timeframe().get(&scenario.bob_feed), Some(0));
    assert!(pipeline.credentials().is_feed_writable(&scenario.bob_feed));
}

#[test]
fn test_unknown_feed_is_rejected() {
    let scenario = Scenario::build();
    let mut pipeline = Pipeline::new(scenario.space_key);
    pipeline.add_feed(scenario.alice_feed).unwrap();

    assert!(matches!(
        pipeline.ingest(scenario.feeds[1][0].clone()),
        Err(SpaceError::UnknownFeed(key)) if key == scenario.bob_feed
    ));
    assert!(matches!(
        pipeline.add_feed(scenario.alice_feed),
        Err(SpaceError::AlreadyAdmitted(_))
    ));
}

#[test]
fn test_malformed_blocks_still_advance() {
    let space_key = SecretKey::generate().public();
    let mut writer = Writer::new();
    let mut pipeline = Pipeline::new(space_key);
    pipeline.add_feed(writer.key()).unwrap();

    let garbage = writer.raw(vec![0xff; 7]);
    let events = pipeline.ingest(garbage).unwrap();
    assert!(events.contains(&SpaceEvent::Malformed {
        feed_key: writer.key(),
        seq: 0,
    }));

    // a message claiming to depend on itself is malformed too
    let own: Timeframe = [(writer.key(), 1)].into_iter().collect();
    let cyclic = writer.write(&own, Payload::Mutation(Mutation::set("k", "v")));
    let events = pipeline.ingest(cyclic).unwrap();
    assert!(events.contains(&SpaceEvent::Malformed {
        feed_key: writer.key(),
        seq: 1,
    }));
    assert_eq!(pipeline.timeframe().get(&writer.key()), Some(1));
    assert!(pipeline.model().get("k").is_none());
}
