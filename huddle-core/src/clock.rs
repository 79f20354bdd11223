//! Lamport stamps for last-writer-wins ordering per record.
//!
//! A stamp is `(counter, peer)`. Counters order causally related writes;
//! the peer id breaks ties between concurrent writes so every replica picks
//! the same winner regardless of arrival order.

use serde::{Deserialize, Serialize};

use crate::record::PeerId;

/// Totally ordered write stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub counter: u64,
    pub peer: PeerId,
}

impl Stamp {
    pub fn new(counter: u64, peer: PeerId) -> Self {
        Self { counter, peer }
    }
}

/// Per-replica Lamport clock.
#[derive(Debug, Clone)]
pub struct LamportClock {
    peer: PeerId,
    counter: u64,
}

impl LamportClock {
    pub fn new(peer: PeerId) -> Self {
        Self { peer, counter: 0 }
    }

    /// Advance for a local write.
    pub fn tick(&mut self) -> Stamp {
        self.counter += 1;
        Stamp::new(self.counter, self.peer)
    }

    /// Fold in a stamp seen on the wire so later local writes order after it.
    pub fn observe(&mut self, stamp: Stamp) {
        self.counter = self.counter.max(stamp.counter);
    }

    pub fn current(&self) -> u64 {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_increments() {
        let peer = PeerId::random();
        let mut clock = LamportClock::new(peer);
        let a = clock.tick();
        let b = clock.tick();
        assert!(b > a);
        assert_eq!(b.counter, 2);
        assert_eq!(b.peer, peer);
    }

    #[test]
    fn test_observe_moves_forward_only() {
        let mut clock = LamportClock::new(PeerId::random());
        clock.observe(Stamp::new(10, PeerId::random()));
        assert_eq!(clock.current(), 10);

        clock.observe(Stamp::new(3, PeerId::random()));
        assert_eq!(clock.current(), 10);

        assert_eq!(clock.tick().counter, 11);
    }

    #[test]
    fn test_tie_broken_by_peer() {
        let p1 = PeerId::random();
        let p2 = PeerId::random();
        let a = Stamp::new(5, p1);
        let b = Stamp::new(5, p2);
        assert_ne!(a, b);
        assert_eq!(a < b, p1 < p2);
    }
}
