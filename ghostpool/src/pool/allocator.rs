//! Proportional reward allocation.
//!
//! Each matured reward is split over the contributions accepted since the
//! previous reward, in proportion to summed share difficulty per address.
//! Difficulty is scaled by 100 and the arithmetic is done in integers, with
//! every credit rounded down, so the credits never add up to more than the
//! reward. The remainder stays with the pool wallet.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::store::BalanceStore;
use crate::error::Result;
use crate::node::NodeClient;
use crate::shares::Contribution;
use crate::stratum::EngineHandle;
use crate::tracing::prelude::*;
use crate::treasury::RewardEvent;
use crate::u256::U256;

/// Recorded as the block hash when the node cannot resolve the reward
/// transaction.
pub const BLOCK_HASH_PLACEHOLDER: &str = "block_hash_placeholder";

/// Miner ID the pool fee is credited under.
pub const POOL_MINER_ID: &str = "pool";

const WORK_SCALE: f64 = 100.0;

/// Supplies the contributions accepted since the last call.
#[async_trait]
pub trait ContributionSource: Send + Sync {
    async fn drain(&self) -> Result<Vec<Contribution>>;
}

#[async_trait]
impl ContributionSource for EngineHandle {
    async fn drain(&self) -> Result<Vec<Contribution>> {
        self.drain_contributions().await
    }
}

/// One address's part of a reward.
#[derive(Debug, Clone, PartialEq)]
pub struct Credit {
    pub address: String,
    pub miner_id: String,
    /// Summed share difficulty.
    pub work: f64,
    pub amount: u64,
}

/// Outcome of one allocation cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationReport {
    pub txn_id: String,
    pub block_hash: String,
    pub daa_score: u64,
    pub credits: Vec<Credit>,
    /// Fee credited to the treasury address, zero if none.
    pub pool_fee: u64,
    /// Credits the store failed to record.
    pub failures: usize,
}

impl AllocationReport {
    pub fn allocated(&self) -> u64 {
        self.credits.iter().map(|c| c.amount).sum()
    }
}

pub struct RewardAllocator {
    contributions: Arc<dyn ContributionSource>,
    store: Arc<dyn BalanceStore>,
    node: Arc<dyn NodeClient>,
    treasury_address: String,
}

// Work per address, in order of first contribution.
struct Work {
    address: String,
    miner_id: String,
    difficulty: f64,
}

impl RewardAllocator {
    pub fn new(
        contributions: Arc<dyn ContributionSource>,
        store: Arc<dyn BalanceStore>,
        node: Arc<dyn NodeClient>,
        treasury_address: impl Into<String>,
    ) -> Self {
        Self {
            contributions,
            store,
            node,
            treasury_address: treasury_address.into(),
        }
    }

    /// Allocate every reward event until shutdown, then any still queued.
    pub async fn run(self, mut events: mpsc::Receiver<RewardEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(&event).await,
                    None => break,
                },
            }
        }

        events.close();
        while let Ok(event) = events.try_recv() {
            self.handle(&event).await;
        }
        debug!("Reward allocator stopped");
    }

    async fn handle(&self, event: &RewardEvent) {
        match self.allocate(event).await {
            Ok(Some(report)) => info!(
                txn_id = %report.txn_id,
                block_hash = %report.block_hash,
                daa_score = report.daa_score,
                addresses = report.credits.len(),
                allocated = report.allocated(),
                pool_fee = report.pool_fee,
                failures = report.failures,
                "Reward allocated"
            ),
            Ok(None) => {}
            Err(e) => error!(txn_id = %event.txn_id, error = %e, "Reward allocation failed"),
        }
    }

    /// Run one allocation cycle.
    ///
    /// Returns `None` when there was no work to reward. Failing to drain
    /// contributions is an error; a failed credit or block lookup is logged
    /// and the cycle carries on.
    pub async fn allocate(&self, event: &RewardEvent) -> Result<Option<AllocationReport>> {
        let works = aggregate(self.contributions.drain().await?);
        for work in &works {
            debug!(address = %work.address, work = work.difficulty, "Address work");
        }

        let scaled: Vec<u128> = works.iter().map(|w| scale(w.difficulty)).collect();
        let total = scaled.iter().fold(U256::ZERO, |sum, w| sum + U256::from(*w));
        if total == U256::ZERO {
            info!(txn_id = %event.txn_id, "No work to allocate reward to");
            return Ok(None);
        }

        let mut credits = Vec::with_capacity(works.len());
        let mut failures = 0;
        for (work, scaled_work) in works.into_iter().zip(scaled) {
            let amount = share_of(event.miner_reward, scaled_work, total);
            if let Err(e) = self
                .store
                .increment(&work.miner_id, &work.address, amount)
                .await
            {
                error!(address = %work.address, miner_id = %work.miner_id, amount, error = %e, "Failed to credit balance");
                failures += 1;
                continue;
            }
            debug!(address = %work.address, miner_id = %work.miner_id, amount, work = work.difficulty, "Credited reward");
            credits.push(Credit {
                address: work.address,
                miner_id: work.miner_id,
                work: work.difficulty,
                amount,
            });
        }

        let (block_hash, daa_score) = match self.node.block_info(&event.txn_id).await {
            Ok(info) => (info.block_hash, info.daa_score),
            Err(e) => {
                warn!(txn_id = %event.txn_id, error = %e, "Failed to resolve reward block");
                (BLOCK_HASH_PLACEHOLDER.to_string(), event.daa_score)
            }
        };

        // The fee is only taken when some miner was paid
        let mut pool_fee = 0;
        if event.pool_fee > 0 && !credits.is_empty() {
            match self
                .store
                .increment(POOL_MINER_ID, &self.treasury_address, event.pool_fee)
                .await
            {
                Ok(()) => pool_fee = event.pool_fee,
                Err(e) => {
                    error!(amount = event.pool_fee, error = %e, "Failed to credit pool fee");
                    failures += 1;
                }
            }
        }

        Ok(Some(AllocationReport {
            txn_id: event.txn_id.clone(),
            block_hash,
            daa_score,
            credits,
            pool_fee,
            failures,
        }))
    }
}

fn aggregate(contributions: Vec<Contribution>) -> Vec<Work> {
    let mut works: Vec<Work> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for c in contributions {
        match index.get(&c.address) {
            Some(&i) => works[i].difficulty += c.difficulty,
            None => {
                index.insert(c.address.clone(), works.len());
                works.push(Work {
                    address: c.address,
                    miner_id: c.miner_id,
                    difficulty: c.difficulty,
                });
            }
        }
    }
    works
}

fn scale(difficulty: f64) -> u128 {
    if difficulty.is_finite() && difficulty > 0.0 {
        (difficulty * WORK_SCALE) as u128
    } else {
        0
    }
}

/// `reward * work / total`, rounded down. Never more than `reward` since
/// `work <= total`.
fn share_of(reward: u64, work: u128, total: U256) -> u64 {
    (U256::from(work) * U256::from(reward) / total).saturating_to_u64()
}
