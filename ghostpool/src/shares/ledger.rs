//! Contribution ledger.
//!
//! Accepted shares are recorded twice: the nonce goes into a dedupe map that
//! only needs to remember the share window, and the contribution is queued
//! for the reward allocator, which drains it on each reward event.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::tracing::prelude::*;

/// Work credited to an address for one accepted share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub address: String,
    pub miner_id: String,
    pub difficulty: f64,
    /// Milliseconds since the Unix epoch at acceptance.
    pub timestamp: u64,
}

pub struct ContributionLedger {
    window: Duration,
    max_pending: usize,
    seen: HashMap<u64, Instant>,
    seen_order: VecDeque<(Instant, u64)>,
    pending: VecDeque<Contribution>,
    dropped: u64,
}

impl ContributionLedger {
    pub fn new(window: Duration, max_pending: usize) -> Self {
        Self {
            window,
            max_pending: max_pending.max(1),
            seen: HashMap::new(),
            seen_order: VecDeque::new(),
            pending: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Whether a nonce was accepted within the window.
    pub fn contains(&self, nonce: u64) -> bool {
        self.seen.contains_key(&nonce)
    }

    /// Record an accepted share.
    pub fn record(&mut self, nonce: u64, now: Instant, contribution: Contribution) {
        self.prune(now);
        self.seen.insert(nonce, now);
        self.seen_order.push_back((now, nonce));

        if self.pending.len() >= self.max_pending {
            if let Some(oldest) = self.pending.pop_front() {
                self.dropped += 1;
                warn!(
                    address = %oldest.address,
                    pending = self.pending.len(),
                    dropped = self.dropped,
                    "Contribution ledger full, dropping oldest entry"
                );
            }
        }
        self.pending.push_back(contribution);
    }

    /// Forget nonces older than the window.
    pub fn prune(&mut self, now: Instant) {
        while let Some(&(at, nonce)) = self.seen_order.front() {
            if now.saturating_duration_since(at) <= self.window {
                break;
            }
            self.seen_order.pop_front();
            // A nonce seen again later keeps its newer entry
            if self.seen.get(&nonce) == Some(&at) {
                self.seen.remove(&nonce);
            }
        }
    }

    /// Take every contribution queued since the last drain.
    pub fn drain(&mut self) -> Vec<Contribution> {
        self.pending.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Contributions discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(address: &str, difficulty: f64) -> Contribution {
        Contribution {
            address: address.to_string(),
            miner_id: "rig".to_string(),
            difficulty,
            timestamp: 0,
        }
    }

    #[test]
    fn test_dedupe_within_window() {
        let t0 = Instant::now();
        let mut ledger = ContributionLedger::new(Duration::from_secs(600), 100);
        ledger.record(7, t0, contribution("a", 1.0));
        assert!(ledger.contains(7));
        assert!(!ledger.contains(8));

        // Pruned once the window passes
        ledger.prune(t0 + Duration::from_secs(601));
        assert!(!ledger.contains(7));
    }

    #[test]
    fn test_drain_empties_queue() {
        let t0 = Instant::now();
        let mut ledger = ContributionLedger::new(Duration::from_secs(600), 100);
        ledger.record(1, t0, contribution("a", 1.0));
        ledger.record(2, t0, contribution("b", 2.0));
        assert_eq!(ledger.pending_len(), 2);

        let drained = ledger.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].address, "a");
        assert_eq!(ledger.pending_len(), 0);
        assert!(ledger.drain().is_empty());

        // Draining does not forget nonces
        assert!(ledger.contains(1));
    }

    #[test]
    fn test_bounded_queue_drops_oldest() {
        let t0 = Instant::now();
        let mut ledger = ContributionLedger::new(Duration::from_secs(600), 2);
        ledger.record(1, t0, contribution("a", 1.0));
        ledger.record(2, t0, contribution("b", 1.0));
        ledger.record(3, t0, contribution("c", 1.0));

        let addresses: Vec<_> = ledger.drain().into_iter().map(|c| c.address).collect();
        assert_eq!(addresses, ["b", "c"]);
        assert_eq!(ledger.dropped(), 1);
    }
}
