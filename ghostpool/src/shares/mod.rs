//! Share validation and per-worker difficulty.
//!
//! The [`ShareEngine`] owns every miner account, the per-worker statistics
//! and the contribution ledger. It is plain data with no locking: the
//! Stratum engine task owns it, so share acceptance, the vardiff tick and the
//! hashrate refresh never race.
//!
//! A submitted share is classified in a fixed order, each stage
//! short-circuiting:
//!
//! 1. nonce already accepted: duplicate
//! 2. no PoW state for the header hash: stale
//! 3. PoW value above the worker's target: invalid
//! 4. otherwise accepted, and a block candidate if it also meets the network
//!    target

mod ledger;
pub mod report;
mod stats;
pub mod vardiff;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::time::Instant;

pub use ledger::{Contribution, ContributionLedger};
pub use report::{PoolStats, WorkerSummary};
pub use stats::{ShareRecord, WorkerStats};
pub use vardiff::VardiffConfig;

use crate::stratum::ConnectionId;
use crate::template::{BlockTemplate, Encoding, Hash, TemplateStore};
use crate::tracing::prelude::*;
use crate::types::{Difficulty, HashRate};
use crate::u256::U256;

/// Share engine tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareConfig {
    /// Difficulty assigned to new workers.
    pub initial_difficulty: Difficulty,
    /// How long share records and dedupe entries are kept.
    pub window: Duration,
    /// Bound on contributions waiting for the allocator.
    pub max_pending_contributions: usize,
    pub vardiff: VardiffConfig,
    /// Log every vardiff evaluation that changes a difficulty at info level.
    pub vardiff_stats: bool,
}

/// Why a share was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShareRejection {
    #[error("duplicate share")]
    Duplicate,

    #[error("stale header")]
    Stale,

    #[error("invalid share")]
    Invalid,
}

/// A share as submitted, after job resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission<'a> {
    pub address: &'a str,
    pub worker: &'a str,
    pub header_hash: Hash,
    /// Difficulty the share is judged against.
    pub difficulty: Difficulty,
    pub nonce: u64,
}

/// A solved template ready for submission to the node.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockCandidate {
    pub template: BlockTemplate,
    pub address: String,
    pub worker: String,
    pub nonce: u64,
}

/// Result of an accepted share.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    /// Proof-of-work value the share achieved.
    pub pow: U256,
    pub block: Option<BlockCandidate>,
}

/// A worker whose difficulty the vardiff loop changed.
#[derive(Debug, Clone, PartialEq)]
pub struct DifficultyChange {
    pub address: String,
    pub worker: String,
    pub difficulty: Difficulty,
    /// Connections the worker is authorized on.
    pub connections: Vec<ConnectionId>,
}

/// Everything known about one payout address.
#[derive(Debug, Default)]
pub struct MinerAccount {
    pub connections: HashSet<ConnectionId>,
    pub workers: HashMap<String, WorkerStats>,
}

pub struct ShareEngine {
    config: ShareConfig,
    accounts: HashMap<String, MinerAccount>,
    ledger: ContributionLedger,
    started: Instant,
    hashrate: HashRate,
}

impl ShareEngine {
    pub fn new(config: ShareConfig, now: Instant) -> Self {
        let ledger = ContributionLedger::new(config.window, config.max_pending_contributions);
        Self {
            config,
            accounts: HashMap::new(),
            ledger,
            started: now,
            hashrate: HashRate::ZERO,
        }
    }

    /// Register a worker on a connection, creating the account and stats on
    /// first sight. Returns the worker's current difficulty.
    pub fn register_worker(
        &mut self,
        address: &str,
        worker: &str,
        connection: ConnectionId,
        encoding: Encoding,
        now: Instant,
    ) -> Difficulty {
        let initial = self.config.initial_difficulty;
        let account = self.accounts.entry(address.to_string()).or_default();
        account.connections.insert(connection);
        let stats = account.workers.entry(worker.to_string()).or_insert_with(|| {
            info!(address, worker, difficulty = %initial, "New worker");
            WorkerStats::new(worker, initial, encoding, now)
        });
        stats.connections.insert(connection);
        stats.min_diff
    }

    /// Forget a closed connection. Accounts and stats are kept.
    pub fn release_connection(&mut self, address: &str, connection: ConnectionId) {
        if let Some(account) = self.accounts.get_mut(address) {
            account.connections.remove(&connection);
            for stats in account.workers.values_mut() {
                stats.connections.remove(&connection);
            }
        }
    }

    pub fn account(&self, address: &str) -> Option<&MinerAccount> {
        self.accounts.get(address)
    }

    pub fn worker(&self, address: &str, worker: &str) -> Option<&WorkerStats> {
        self.accounts.get(address)?.workers.get(worker)
    }

    /// Current difficulty of a registered worker.
    pub fn worker_difficulty(&self, address: &str, worker: &str) -> Option<Difficulty> {
        self.worker(address, worker).map(|stats| stats.min_diff)
    }

    /// Validate a share and record the outcome.
    pub fn add_share(
        &mut self,
        share: Submission<'_>,
        templates: &mut TemplateStore,
        now: Instant,
    ) -> Result<Accepted, ShareRejection> {
        let window = self.config.window;
        let duplicate = self.ledger.contains(share.nonce);
        let stats = worker_entry(
            &mut self.accounts,
            share.address,
            share.worker,
            share.difficulty,
            now,
        );

        if duplicate {
            stats.duplicate += 1;
            debug!(address = share.address, worker = share.worker, nonce = share.nonce, "Duplicate share");
            return Err(ShareRejection::Duplicate);
        }

        let Some(state) = templates.pow_state(&share.header_hash) else {
            stats.stale += 1;
            debug!(address = share.address, worker = share.worker, hash = %share.header_hash, "Stale share");
            return Err(ShareRejection::Stale);
        };

        let (is_block, pow) = state.check_work(share.nonce);
        if pow > share.difficulty.to_target() {
            stats.invalid += 1;
            debug!(
                address = share.address,
                worker = share.worker,
                achieved = %Difficulty::from_target(pow),
                required = %share.difficulty,
                "Low difficulty share"
            );
            return Err(ShareRejection::Invalid);
        }

        stats.record_accepted(now, share.difficulty, window);
        self.ledger.record(
            share.nonce,
            now,
            Contribution {
                address: share.address.to_string(),
                miner_id: share.worker.to_string(),
                difficulty: share.difficulty.as_f64(),
                timestamp: unix_millis(),
            },
        );
        trace!(address = share.address, worker = share.worker, difficulty = %share.difficulty, "Share accepted");

        let block = if is_block {
            templates.consume(&share.header_hash).map(|mut template| {
                template.header.nonce = share.nonce;
                info!(
                    address = share.address,
                    worker = share.worker,
                    hash = %share.header_hash,
                    nonce = share.nonce,
                    "Block found"
                );
                BlockCandidate {
                    template,
                    address: share.address.to_string(),
                    worker: share.worker.to_string(),
                    nonce: share.nonce,
                }
            })
        } else {
            None
        };

        Ok(Accepted { pow, block })
    }

    /// Count a submission whose job ID did not resolve.
    pub fn record_job_not_found(&mut self, address: &str, worker: &str) {
        if let Some(stats) = self.worker_mut(address, worker) {
            stats.jobs_not_found += 1;
        }
    }

    /// Count a block the node accepted.
    pub fn record_block(&mut self, address: &str, worker: &str) {
        if let Some(stats) = self.worker_mut(address, worker) {
            stats.blocks += 1;
        }
    }

    fn worker_mut(&mut self, address: &str, worker: &str) -> Option<&mut WorkerStats> {
        self.accounts.get_mut(address)?.workers.get_mut(worker)
    }

    /// Run one vardiff step over every worker.
    pub fn vardiff_tick(&mut self, now: Instant) -> Vec<DifficultyChange> {
        let mut changes = Vec::new();
        for (address, account) in &mut self.accounts {
            for (name, stats) in &mut account.workers {
                let previous = stats.min_diff;
                let shares = stats.vardiff_shares;
                let Some(difficulty) = vardiff::step(stats, now, &self.config.vardiff) else {
                    continue;
                };

                if self.config.vardiff_stats {
                    info!(address = %address, worker = %name, shares, from = %previous, to = %difficulty, "Vardiff");
                } else {
                    debug!(address = %address, worker = %name, shares, from = %previous, to = %difficulty, "Vardiff");
                }
                changes.push(DifficultyChange {
                    address: address.clone(),
                    worker: name.clone(),
                    difficulty,
                    connections: stats.connections.iter().copied().collect(),
                });
            }
        }
        changes
    }

    /// Refresh every worker's hashrate and return the pool total.
    pub fn update_hashrates(&mut self, now: Instant) -> HashRate {
        let window = self.config.window;
        self.hashrate = self
            .accounts
            .values_mut()
            .flat_map(|account| account.workers.values_mut())
            .map(|stats| stats.update_hashrate(now, window))
            .sum();
        self.ledger.prune(now);
        self.hashrate
    }

    #[cfg(test)]
    pub(crate) fn contribute(&mut self, contribution: Contribution, now: Instant) {
        self.ledger.record(rand::random(), now, contribution);
    }

    /// Hand every pending contribution to the allocator.
    pub fn drain_contributions(&mut self) -> Vec<Contribution> {
        let drained = self.ledger.drain();
        debug!(count = drained.len(), "Drained contributions");
        drained
    }

    pub fn pending_contributions(&self) -> usize {
        self.ledger.pending_len()
    }

    /// Snapshot of every worker. Connection and template counts are left
    /// for the caller to fill in.
    pub fn snapshot(&self, now: Instant) -> PoolStats {
        let mut workers: Vec<WorkerSummary> = self
            .accounts
            .iter()
            .flat_map(|(address, account)| {
                account.workers.values().map(move |stats| WorkerSummary {
                    address: address.clone(),
                    worker: stats.name.clone(),
                    encoding: stats.encoding.to_string(),
                    difficulty: stats.min_diff,
                    hashrate: stats.hashrate,
                    shares: stats.shares,
                    stale: stats.stale,
                    invalid: stats.invalid,
                    duplicate: stats.duplicate,
                    jobs_not_found: stats.jobs_not_found,
                    blocks: stats.blocks,
                    uptime_secs: stats.uptime(now).as_secs(),
                    last_share_secs: stats
                        .last_share
                        .map(|at| now.saturating_duration_since(at).as_secs()),
                })
            })
            .collect();
        workers.sort_by(|a, b| (&a.address, &a.worker).cmp(&(&b.address, &b.worker)));

        PoolStats {
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
            hashrate: self.hashrate,
            miners: self.accounts.len(),
            connections: 0,
            live_templates: 0,
            pending_contributions: self.ledger.pending_len(),
            dropped_contributions: self.ledger.dropped(),
            workers,
        }
    }
}

// Stats for a worker, created if a share arrives before registration.
fn worker_entry<'a>(
    accounts: &'a mut HashMap<String, MinerAccount>,
    address: &str,
    worker: &str,
    difficulty: Difficulty,
    now: Instant,
) -> &'a mut WorkerStats {
    accounts
        .entry(address.to_string())
        .or_default()
        .workers
        .entry(worker.to_string())
        .or_insert_with(|| WorkerStats::new(worker, difficulty, Encoding::default(), now))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
