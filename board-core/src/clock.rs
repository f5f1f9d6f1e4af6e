//! Causal timestamps for conflict resolution.
//!
//! Every delta carries a Lamport stamp `(time, client)`. Stamps are
//! totally ordered — time first, client id as the tie-break — so all
//! replicas resolve a concurrent write to the same field identically.
//!
//! Version vectors summarize what a replica has seen per client and
//! drive reconnection catch-up: a peer sends its vector, the other
//! side answers with exactly the deltas the vector does not cover.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Detecting Concurrent Writes)

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of an editing replica (one per client instance).
pub type ClientId = Uuid;

/// A Lamport stamp: logical time plus the writing client.
///
/// Derived ordering compares `time` first and falls back to `client`,
/// which is exactly the tie-break the merge needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lamport {
    pub time: u64,
    pub client: ClientId,
}

impl Lamport {
    pub fn new(time: u64, client: ClientId) -> Self {
        Self { time, client }
    }
}

/// Per-replica logical clock.
///
/// `tick` stamps a local edit; `observe` advances past any remote
/// stamp so later local edits causally follow everything applied.
#[derive(Debug, Clone)]
pub struct LamportClock {
    time: u64,
    client: ClientId,
}

impl LamportClock {
    pub fn new(client: ClientId) -> Self {
        Self { time: 0, client }
    }

    /// Stamp for a new local edit.
    pub fn tick(&mut self) -> Lamport {
        self.time += 1;
        Lamport::new(self.time, self.client)
    }

    /// Advance past a remote stamp.
    pub fn observe(&mut self, stamp: Lamport) {
        if stamp.time > self.time {
            self.time = stamp.time;
        }
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn client(&self) -> ClientId {
        self.client
    }
}

/// Max Lamport time observed per client.
///
/// Tolerates duplication and reordering: `contains` answers "have I
/// already seen this stamp" without retaining the full delta history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    entries: HashMap<ClientId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Max time observed for the given client (0 if never seen).
    pub fn get(&self, client: &ClientId) -> u64 {
        self.entries.get(client).copied().unwrap_or(0)
    }

    /// Whether this vector already covers the given stamp.
    pub fn contains(&self, stamp: &Lamport) -> bool {
        self.get(&stamp.client) >= stamp.time
    }

    /// Record a stamp.
    pub fn observe(&mut self, stamp: &Lamport) {
        let entry = self.entries.entry(stamp.client).or_insert(0);
        if stamp.time > *entry {
            *entry = stamp.time;
        }
    }

    /// Pointwise max with another vector.
    pub fn merge(&mut self, other: &VersionVector) {
        for (client, time) in &other.entries {
            let entry = self.entries.entry(*client).or_insert(0);
            if *time > *entry {
                *entry = *time;
            }
        }
    }

    /// Whether this vector covers everything `other` covers.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .entries
            .iter()
            .all(|(client, time)| self.get(client) >= *time)
    }

    pub fn clients(&self) -> impl Iterator<Item = (&ClientId, &u64)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_ordering_time_first() {
        let a = Lamport::new(1, Uuid::new_v4());
        let b = Lamport::new(2, Uuid::new_v4());
        assert!(a < b);
    }

    #[test]
    fn test_stamp_ordering_client_tiebreak() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);
        let a = Lamport::new(5, low);
        let b = Lamport::new(5, high);
        assert!(a < b);
        assert!(b > a);
    }

    #[test]
    fn test_clock_tick_monotonic() {
        let mut clock = LamportClock::new(Uuid::new_v4());
        let s1 = clock.tick();
        let s2 = clock.tick();
        assert!(s2 > s1);
        assert_eq!(s2.time, s1.time + 1);
    }

    #[test]
    fn test_clock_observe_advances() {
        let client = Uuid::new_v4();
        let remote = Uuid::new_v4();
        let mut clock = LamportClock::new(client);
        clock.observe(Lamport::new(10, remote));

        // Next local stamp must causally follow the observed one
        let stamp = clock.tick();
        assert_eq!(stamp.time, 11);
        assert_eq!(stamp.client, client);
    }

    #[test]
    fn test_clock_observe_ignores_past() {
        let mut clock = LamportClock::new(Uuid::new_v4());
        clock.tick();
        clock.tick();
        clock.observe(Lamport::new(1, Uuid::new_v4()));
        assert_eq!(clock.time(), 2);
    }

    #[test]
    fn test_vv_contains() {
        let client = Uuid::new_v4();
        let mut vv = VersionVector::new();
        assert!(!vv.contains(&Lamport::new(1, client)));

        vv.observe(&Lamport::new(3, client));
        assert!(vv.contains(&Lamport::new(1, client)));
        assert!(vv.contains(&Lamport::new(3, client)));
        assert!(!vv.contains(&Lamport::new(4, client)));
    }

    #[test]
    fn test_vv_observe_out_of_order() {
        let client = Uuid::new_v4();
        let mut vv = VersionVector::new();
        vv.observe(&Lamport::new(5, client));
        vv.observe(&Lamport::new(2, client)); // late duplicate
        assert_eq!(vv.get(&client), 5);
    }

    #[test]
    fn test_vv_merge_and_dominates() {
        let a_client = Uuid::new_v4();
        let b_client = Uuid::new_v4();

        let mut a = VersionVector::new();
        a.observe(&Lamport::new(4, a_client));

        let mut b = VersionVector::new();
        b.observe(&Lamport::new(7, b_client));

        assert!(!a.dominates(&b));
        a.merge(&b);
        assert!(a.dominates(&b));
        assert_eq!(a.get(&a_client), 4);
        assert_eq!(a.get(&b_client), 7);
    }
}
