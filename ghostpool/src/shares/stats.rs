//! Per-worker share statistics and hashrate estimation.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::stratum::ConnectionId;
use crate::template::Encoding;
use crate::types::{Difficulty, HashRate};

/// Decay rate of share weights across the window. A share at the far edge
/// of the window weighs `exp(-5)` of a fresh one.
const DECAY: f64 = 5.0;

/// One accepted share, kept for hashrate estimation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShareRecord {
    pub at: Instant,
    pub difficulty: f64,
}

/// Counters and vardiff state for one worker of one address.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub name: String,
    /// Encoding of the connection that registered the worker, as a hardware hint.
    pub encoding: Encoding,
    /// Open connections the worker is authorized on.
    pub connections: HashSet<ConnectionId>,

    pub shares: u64,
    pub stale: u64,
    pub invalid: u64,
    pub duplicate: u64,
    pub jobs_not_found: u64,
    pub blocks: u64,

    pub started: Instant,
    pub last_share: Option<Instant>,

    pub vardiff_start: Instant,
    pub vardiff_shares: u64,
    pub vardiff_window: usize,
    pub min_diff: Difficulty,

    pub recent: VecDeque<ShareRecord>,
    pub hashrate: HashRate,
}

impl WorkerStats {
    pub fn new(name: impl Into<String>, difficulty: Difficulty, encoding: Encoding, now: Instant) -> Self {
        Self {
            name: name.into(),
            encoding,
            connections: HashSet::new(),
            shares: 0,
            stale: 0,
            invalid: 0,
            duplicate: 0,
            jobs_not_found: 0,
            blocks: 0,
            started: now,
            last_share: None,
            vardiff_start: now,
            vardiff_shares: 0,
            vardiff_window: 0,
            min_diff: difficulty,
            recent: VecDeque::new(),
            hashrate: HashRate::ZERO,
        }
    }

    /// Count an accepted share at `difficulty`.
    pub fn record_accepted(&mut self, now: Instant, difficulty: Difficulty, window: Duration) {
        self.shares += 1;
        self.vardiff_shares += 1;
        self.last_share = Some(now);
        self.recent.push_back(ShareRecord {
            at: now,
            difficulty: difficulty.as_f64(),
        });
        self.prune(now, window);
    }

    /// Drop share records older than `window`.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.recent.front() {
            if now.saturating_duration_since(front.at) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Recompute and store the hashrate over the recent window.
    ///
    /// Each share's difficulty is weighted by `exp(-5 * age / window)`, and
    /// the decayed average difficulty stands in for the work behind each
    /// retained share. Elapsed time runs from the oldest retained share and
    /// is at least one second.
    pub fn update_hashrate(&mut self, now: Instant, window: Duration) -> HashRate {
        self.prune(now, window);
        self.hashrate = estimate_hashrate(&self.recent, now, window);
        self.hashrate
    }

    /// Restart the vardiff observation at `difficulty`.
    pub fn reset_vardiff(&mut self, difficulty: Difficulty, now: Instant) {
        self.min_diff = difficulty;
        self.vardiff_start = now;
        self.vardiff_shares = 0;
        self.vardiff_window = 0;
    }

    pub fn uptime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }
}

fn estimate_hashrate(recent: &VecDeque<ShareRecord>, now: Instant, window: Duration) -> HashRate {
    let Some(oldest) = recent.front() else {
        return HashRate::ZERO;
    };

    let window_secs = window.as_secs_f64().max(1.0);
    let (weighted, weights) = recent.iter().fold((0.0, 0.0), |(sum, total), share| {
        let age = now.saturating_duration_since(share.at).as_secs_f64();
        let weight = (-DECAY * age / window_secs).exp();
        (sum + weight * share.difficulty, total + weight)
    });
    if weights <= 0.0 {
        return HashRate::ZERO;
    }

    let elapsed = now.saturating_duration_since(oldest.at).as_secs_f64().max(1.0);
    HashRate::from_shares(weighted / weights, recent.len() as f64, elapsed)
}
