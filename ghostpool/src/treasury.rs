//! Treasury events.
//!
//! The treasury watches the pool wallet and reports each coinbase output
//! once it has matured. The pool keeps its fee and hands the rest to the
//! reward allocator as a [`RewardEvent`]. Amounts are in sompi.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// A matured coinbase as reported by the treasury.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinbaseNotice {
    pub reward: u64,
    pub txn_id: String,
    pub daa_score: u64,
}

/// A fee-split reward ready for allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardEvent {
    pub miner_reward: u64,
    pub pool_fee: u64,
    pub txn_id: String,
    pub daa_score: u64,
}

impl RewardEvent {
    pub fn from_coinbase(notice: CoinbaseNotice, fee_percent: f64) -> Self {
        let (miner_reward, pool_fee) = split_coinbase(notice.reward, fee_percent);
        Self {
            miner_reward,
            pool_fee,
            txn_id: notice.txn_id,
            daa_score: notice.daa_score,
        }
    }
}

/// Split a coinbase reward into the miners' part and the pool fee.
///
/// The fee percentage is taken to two decimal places (basis points), and
/// the fee is rounded down.
pub fn split_coinbase(reward: u64, fee_percent: f64) -> (u64, u64) {
    let basis_points = (fee_percent * 100.0).round().clamp(0.0, 10_000.0) as u128;
    let fee = (u128::from(reward) * basis_points / 10_000) as u64;
    (reward - fee, fee)
}

/// The most recent coinbase transactions already queued, oldest evicted
/// first.
#[derive(Debug)]
pub struct HandledCoinbases {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl HandledCoinbases {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record `txn_id`. Returns false if it was already recorded.
    pub fn insert(&mut self, txn_id: &str) -> bool {
        if !self.seen.insert(txn_id.to_string()) {
            return false;
        }
        self.order.push_back(txn_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Forget `txn_id`, so a later notice for it is queued again.
    pub fn remove(&mut self, txn_id: &str) {
        if self.seen.remove(txn_id) {
            self.order.retain(|id| id != txn_id);
        }
    }
}
