//! Vector clocks over feeds
//!
//! A [`Timeframe`] maps feed keys to the highest sequence number observed
//! (0-based). A message's timeframe records what its writer had processed
//! when it wrote, which is exactly the set of messages it causally follows.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;

#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timeframe {
    frames: BTreeMap<PublicKey, u64>,
}

impl Timeframe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence seen for `feed`
    pub fn get(&self, feed: &PublicKey) -> Option<u64> {
        self.frames.get(feed).copied()
    }

    /// Record that `seq` of `feed` was observed. Never moves backwards.
    pub fn set(&mut self, feed: PublicKey, seq: u64) {
        let entry = self.frames.entry(feed).or_insert(seq);
        *entry = (*entry).max(seq);
    }

    /// Pointwise maximum with `other`
    pub fn merge(&mut self, other: &Timeframe) {
        for (feed, seq) in &other.frames {
            self.set(*feed, *seq);
        }
    }

    pub fn merged(a: &Timeframe, b: &Timeframe) -> Timeframe {
        let mut out = a.clone();
        out.merge(b);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PublicKey, &u64)> {
        self.frames.iter()
    }

    pub fn feeds(&self) -> impl Iterator<Item = &PublicKey> {
        self.frames.keys()
    }

    /// True if every entry of `required` has been reached
    pub fn satisfies(&self, required: &Timeframe) -> bool {
        required
            .frames
            .iter()
            .all(|(feed, seq)| self.get(feed).is_some_and(|have| have >= *seq))
    }

    /// Entries of `required` that have not been reached yet
    pub fn dependencies(&self, required: &Timeframe) -> Timeframe {
        Timeframe {
            frames: required
                .frames
                .iter()
                .filter(|(feed, seq)| self.get(feed).map_or(true, |have| have < **seq))
                .map(|(feed, seq)| (*feed, *seq))
                .collect(),
        }
    }

    /// True if `self` has observed something `other` has not
    pub fn has_news_for(&self, other: &Timeframe) -> bool {
        !other.satisfies(self)
    }

    /// Number of messages `self` has seen beyond `other`
    pub fn new_messages(&self, other: &Timeframe) -> u64 {
        self.frames
            .iter()
            .map(|(feed, seq)| match other.get(feed) {
                Some(theirs) => seq.saturating_sub(theirs),
                None => seq + 1,
            })
            .sum()
    }
}

impl FromIterator<(PublicKey, u64)> for Timeframe {
    fn from_iter<I: IntoIterator<Item = (PublicKey, u64)>>(iter: I) -> Self {
        let mut timeframe = Timeframe::new();
        for (feed, seq) in iter {
            timeframe.set(feed, seq);
        }
        timeframe
    }
}

/// Pointwise order: `a <= b` iff every entry of `a` is reached by `b`.
/// Concurrent timeframes are incomparable.
impl PartialOrd for Timeframe {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (other.satisfies(self), self.satisfies(other)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

impl fmt::Debug for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.frames.iter().map(|(k, v)| (k.short(), v)))
            .finish()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use test_strategy::proptest;

    use super::*;
    use crate::crypto::SecretKey;

    fn frame(entries: &[(u8, u64)]) -> Timeframe {
        entries
            .iter()
            .map(|(feed, seq)| (SecretKey::from([*feed + 1; 32]).public(), *seq))
            .collect()
    }

    fn keys() -> (PublicKey, PublicKey) {
        (SecretKey::generate().public(), SecretKey::generate().public())
    }

    #[test]
    fn test_merge_is_pointwise_max() {
        let (a, b) = keys();
        let left: Timeframe = [(a, 3), (b, 1)].into_iter().collect();
        let right: Timeframe = [(a, 1), (b, 4)].into_iter().collect();

        let merged = Timeframe::merged(&left, &right);
        assert_eq!(merged.get(&a), Some(3));
        assert_eq!(merged.get(&b), Some(4));
        assert_eq!(merged, Timeframe::merged(&right, &left));
    }

    #[test]
    fn test_partial_order_and_dependencies() {
        let (a, b) = keys();
        let small: Timeframe = [(a, 1)].into_iter().collect();
        let big: Timeframe = [(a, 2), (b, 0)].into_iter().collect();
        let other: Timeframe = [(b, 5)].into_iter().collect();

        assert!(small < big);
        assert!(big > small);
        assert_eq!(small.partial_cmp(&other), None);
        assert!(Timeframe::new() <= small);

        let missing = small.dependencies(&big);
        assert_eq!(missing.len(), 2);
        assert!(big.dependencies(&small).is_empty());

        assert!(big.has_news_for(&small));
        assert!(!small.has_news_for(&big));
        assert_eq!(big.new_messages(&small), 2);
    }

    #[test]
    fn test_set_never_regresses() {
        let (a, _) = keys();
        let mut timeframe = Timeframe::new();
        timeframe.set(a, 4);
        timeframe.set(a, 2);
        assert_eq!(timeframe.get(&a), Some(4));
    }

    #[proptest(cases = 64)]
    fn test_merge_is_a_least_upper_bound(
        #[strategy(proptest::collection::vec((0..4u8, 0..16u64), 0..8))] a: Vec<(u8, u64)>,
        #[strategy(proptest::collection::vec((0..4u8, 0..16u64), 0..8))] b: Vec<(u8, u64)>,
    ) {
        let (a, b) = (frame(&a), frame(&b));
        let merged = Timeframe::merged(&a, &b);

        prop_assert!(a <= merged);
        prop_assert!(b <= merged);
        prop_assert_eq!(&merged, &Timeframe::merged(&b, &a));
        prop_assert_eq!(&merged, &Timeframe::merged(&merged, &a));
        prop_assert!(merged.satisfies(&a) && merged.satisfies(&b));
        prop_assert!(a.dependencies(&merged).iter().all(|(feed, seq)| a.get(feed) < Some(*seq)));
    }
}
