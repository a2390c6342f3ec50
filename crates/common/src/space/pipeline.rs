use std::collections::{BTreeMap, BTreeSet};

use super::message::{Payload, SpaceMessage};
use super::model::ObjectModel;
use super::{DropReason, SpaceError, SpaceEvent};
use crate::credentials::{
    CredentialOutcome, DeviceChainTrigger, SpaceStateMachine, StateChange,
};
use crate::crypto::PublicKey;
use crate::feed::FeedBlock;
use crate::timeframe::Timeframe;

/// Position of a message in the space's total order
///
/// Messages are ordered by lamport timestamp, ties broken by feed key and
/// then sequence. Every replica computes the same key for the same block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub lamport: u64,
    pub feed_key: PublicKey,
    pub seq: u64,
}

enum Decoded {
    Message(SpaceMessage),
    Malformed,
}

#[derive(Default)]
struct FeedCursor {
    /// Lamport timestamp of every processed block, indexed by seq
    lamports: Vec<u64>,
    /// Received but not yet processed, waiting on dependencies
    pending: BTreeMap<u64, Decoded>,
    degraded: bool,
}

impl FeedCursor {
    fn next_seq(&self) -> u64 {
        self.lamports.len() as u64
    }
}

struct State {
    credentials: SpaceStateMachine,
    model: ObjectModel,
}

/// Deterministic merge of a space's feeds
///
/// Blocks are ingested per feed in sequence order. A block is processed
/// once every entry of its timeframe has been processed; it is then given
/// a lamport timestamp one past the largest of its dependencies and its own
/// feed's previous block. Credentials and mutations are folded into state
/// in [`OrderKey`] order. A block that arrives behind the fold position
/// triggers a rebuild from the ordered log, so replicas that saw the same
/// blocks in any order reach the same state.
pub struct Pipeline {
    space_key: PublicKey,
    local_device: Option<(PublicKey, DeviceChainTrigger)>,
    feeds: BTreeMap<PublicKey, FeedCursor>,
    log: BTreeMap<OrderKey, Payload>,
    timeframe: Timeframe,
    state: State,
    applied_upto: Option<OrderKey>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("space_key", &self.space_key)
            .field("feeds", &self.feeds.len())
            .field("log", &self.log.len())
            .field("timeframe", &self.timeframe)
            .finish()
    }
}

impl Pipeline {
    pub fn new(space_key: PublicKey) -> Self {
        Self {
            space_key,
            local_device: None,
            feeds: BTreeMap::new(),
            log: BTreeMap::new(),
            timeframe: Timeframe::new(),
            state: State {
                credentials: SpaceStateMachine::new(space_key),
                model: ObjectModel::new(),
            },
            applied_upto: None,
        }
    }

    /// Fire `trigger` when this space authorizes `device`
    pub fn with_local_device(mut self, device: PublicKey, trigger: DeviceChainTrigger) -> Self {
        self.local_device = Some((device, trigger));
        self.state.credentials = self.fresh_credentials();
        self
    }

    fn fresh_credentials(&self) -> SpaceStateMachine {
        let machine = SpaceStateMachine::new(self.space_key);
        match &self.local_device {
            Some((device, trigger)) => machine.with_local_device(*device, trigger.clone()),
            None => machine,
        }
    }

    pub fn space_key(&self) -> PublicKey {
        self.space_key
    }

    /// Start consuming `feed_key`
    ///
    /// # Errors
    /// * `SpaceError::AlreadyAdmitted` - the feed is already tracked
    pub fn add_feed(&mut self, feed_key: PublicKey) -> Result<(), SpaceError> {
        if self.feeds.contains_key(&feed_key) {
            return Err(SpaceError::AlreadyAdmitted(feed_key));
        }
        self.feeds.insert(feed_key, FeedCursor::default());
        Ok(())
    }

    pub fn has_feed(&self, feed_key: &PublicKey) -> bool {
        self.feeds.contains_key(feed_key)
    }

    pub fn feeds(&self) -> Vec<PublicKey> {
        self.feeds.keys().copied().collect()
    }

    /// Next sequence the pipeline expects from `feed_key`
    pub fn next_seq(&self, feed_key: &PublicKey) -> Option<u64> {
        self.feeds.get(feed_key).map(FeedCursor::next_seq)
    }

    /// Blocks received from `feed_key` that still wait on dependencies
    pub fn pending(&self, feed_key: &PublicKey) -> usize {
        self.feeds.get(feed_key).map_or(0, |cursor| cursor.pending.len())
    }

    /// Stop waiting on a feed that can no longer be read
    pub fn mark_degraded(&mut self, feed_key: &PublicKey) {
        if let Some(cursor) = self.feeds.get_mut(feed_key) {
            cursor.degraded = true;
        }
    }

    pub fn is_degraded(&self, feed_key: &PublicKey) -> bool {
        self.feeds.get(feed_key).is_some_and(|cursor| cursor.degraded)
    }

    /// Highest processed seq per feed
    pub fn timeframe(&self) -> &Timeframe {
        &self.timeframe
    }

    pub fn model(&self) -> &ObjectModel {
        &self.state.model
    }

    pub fn credentials(&self) -> &SpaceStateMachine {
        &self.state.credentials
    }

    /// Order keys of every processed message
    pub fn ordered(&self) -> impl Iterator<Item = &OrderKey> {
        self.log.keys()
    }

    /// Accept a block from a tracked feed and process everything that became ready
    ///
    /// Ingesting a block that was already processed or queued is a no-op.
    ///
    /// # Errors
    /// * `SpaceError::UnknownFeed` - the block's feed is not tracked
    pub fn ingest(&mut self, block: FeedBlock) -> Result<Vec<SpaceEvent>, SpaceError> {
        let cursor = self
            .feeds
            .get_mut(&block.feed_key)
            .ok_or(SpaceError::UnknownFeed(block.feed_key))?;
        if block.seq < cursor.next_seq() || cursor.pending.contains_key(&block.seq) {
            return Ok(Vec::new());
        }

        let decoded = match SpaceMessage::decode(&block.payload) {
            Ok(message)
                if message
                    .timeframe
                    .get(&block.feed_key)
                    .is_some_and(|own| own >= block.seq) =>
            {
                tracing::warn!(
                    "message {}:{} depends on itself, treating as malformed",
                    block.feed_key.short(),
                    block.seq
                );
                Decoded::Malformed
            }
            Ok(message) => Decoded::Message(message),
            Err(e) => {
                tracing::warn!(
                    "undecodable message {}:{}: {}",
                    block.feed_key.short(),
                    block.seq,
                    e
                );
                Decoded::Malformed
            }
        };
        cursor.pending.insert(block.seq, decoded);
        Ok(self.drain())
    }

    fn drain(&mut self) -> Vec<SpaceEvent> {
        let mut events = Vec::new();
        loop {
            let mut progressed = false;
            let keys: Vec<PublicKey> = self.feeds.keys().copied().collect();
            for key in keys {
                while let Some((seq, decoded)) = self.take_ready(&key) {
                    self.process(key, seq, decoded, &mut events);
                    progressed = true;
                }
            }
            if !progressed {
                return events;
            }
        }
    }

    fn take_ready(&mut self, key: &PublicKey) -> Option<(u64, Decoded)> {
        let cursor = self.feeds.get(key)?;
        let next = cursor.next_seq();
        if let Decoded::Message(message) = cursor.pending.get(&next)? {
            if !self.timeframe.satisfies(&message.timeframe) {
                return None;
            }
        }
        let decoded = self.feeds.get_mut(key)?.pending.remove(&next)?;
        Some((next, decoded))
    }

    fn process(&mut self, feed_key: PublicKey, seq: u64, decoded: Decoded, events: &mut Vec<SpaceEvent>) {
        let previous = self
            .feeds
            .get(&feed_key)
            .and_then(|cursor| cursor.lamports.last().copied())
            .unwrap_or(0);

        let message = match decoded {
            Decoded::Message(message) => message,
            Decoded::Malformed => {
                self.record(feed_key, seq, previous + 1);
                events.push(SpaceEvent::Malformed { feed_key, seq });
                events.push(SpaceEvent::Processed { feed_key, seq });
                return;
            }
        };

        let lamport = 1 + message
            .timeframe
            .iter()
            .filter_map(|(dep, dep_seq)| {
                self.feeds
                    .get(dep)
                    .and_then(|cursor| cursor.lamports.get(*dep_seq as usize))
                    .copied()
            })
            .fold(previous, u64::max);
        self.record(feed_key, seq, lamport);

        let order = OrderKey {
            lamport,
            feed_key,
            seq,
        };
        self.log.insert(order, message.payload);

        if self.applied_upto.map_or(true, |applied| order > applied) {
            if let Some(payload) = self.log.get(&order) {
                apply(&mut self.state, &order, payload, events);
            }
            self.applied_upto = Some(order);
        } else {
            self.rebuild(events);
        }
        events.push(SpaceEvent::Processed { feed_key, seq });
    }

    fn record(&mut self, feed_key: PublicKey, seq: u64, lamport: u64) {
        if let Some(cursor) = self.feeds.get_mut(&feed_key) {
            cursor.lamports.push(lamport);
        }
        self.timeframe.set(feed_key, seq);
    }

    /// Re-fold the whole ordered log from empty state
    fn rebuild(&mut self, events: &mut Vec<SpaceEvent>) {
        tracing::debug!(
            "rebuilding space {} from {} messages",
            self.space_key.short(),
            self.log.len()
        );
        let before: BTreeSet<PublicKey> =
            self.state.credentials.admitted_feeds().into_iter().collect();

        self.state = State {
            credentials: self.fresh_credentials(),
            model: ObjectModel::new(),
        };
        let mut replayed = Vec::new();
        for (order, payload) in &self.log {
            apply(&mut self.state, order, payload, &mut replayed);
        }
        self.applied_upto = self.log.keys().next_back().copied();

        for feed_key in self.state.credentials.admitted_feeds() {
            if before.contains(&feed_key) {
                continue;
            }
            if let Some(info) = self.state.credentials.feed(&feed_key) {
                events.push(SpaceEvent::StateChanged(StateChange::FeedAdmitted {
                    feed_key,
                    identity_key: info.identity_key,
                    device_key: info.device_key,
                }));
            }
        }
        events.push(SpaceEvent::Rebuilt);
    }
}

fn apply(state: &mut State, order: &OrderKey, payload: &Payload, events: &mut Vec<SpaceEvent>) {
    let (feed_key, seq) = (order.feed_key, order.seq);
    match payload {
        Payload::Credential(credential) => match state.credentials.process(credential) {
            Ok(CredentialOutcome::Applied(change)) => {
                events.push(SpaceEvent::StateChanged(change));
            }
            Ok(CredentialOutcome::Duplicate | CredentialOutcome::Ignored) => {}
            Err(e) => {
                tracing::warn!(
                    "rejected {} credential at {}:{}: {}",
                    credential.kind(),
                    feed_key.short(),
                    seq,
                    e
                );
                events.push(SpaceEvent::CredentialRejected {
                    feed_key,
                    seq,
                    reason: e.to_string(),
                });
            }
        },
        Payload::Mutation(mutation) => {
            if !state.credentials.is_feed_writable(&feed_key) {
                tracing::debug!(
                    "dropping mutation {}:{} from unauthorized feed",
                    feed_key.short(),
                    seq
                );
                events.push(SpaceEvent::MutationDropped {
                    feed_key,
                    seq,
                    reason: DropReason::Unauthorized,
                });
                return;
            }
            match state.model.apply(mutation) {
                Ok(()) => events.push(SpaceEvent::Updated { feed_key, seq }),
                Err(e) => {
                    tracing::debug!("invalid mutation {}:{}: {}", feed_key.short(), seq, e);
                    events.push(SpaceEvent::MutationDropped {
                        feed_key,
                        seq,
                        reason: DropReason::Invalid(e.to_string()),
                    });
                }
            }
        }
    }
}
