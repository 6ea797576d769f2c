//! Reward accounting.
//!
//! The treasury reports matured coinbase rewards as [`RewardEvent`]s. For
//! each one the [`RewardAllocator`] drains the contributions accepted since
//! the previous reward from the Stratum engine and credits every
//! contributing address through a [`BalanceStore`].
//!
//! [`RewardEvent`]: crate::treasury::RewardEvent

mod allocator;
mod store;

pub use allocator::{
    AllocationReport, ContributionSource, Credit, RewardAllocator, BLOCK_HASH_PLACEHOLDER,
    POOL_MINER_ID,
};
pub use store::{Balance, BalanceStore, MemoryStore};
