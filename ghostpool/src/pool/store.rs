//! Balance storage.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Credited balance of one miner ID at one address, in sompi.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub miner_id: String,
    pub address: String,
    pub balance: u64,
}

/// Where allocated rewards are credited.
///
/// Each increment must be atomic: a balance is never observed half
/// updated.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn increment(&self, miner_id: &str, address: &str, amount: u64) -> Result<()>;

    async fn read_all(&self) -> Result<Vec<Balance>>;
}

/// Process-local balances.
#[derive(Debug, Default)]
pub struct MemoryStore {
    // (address, miner_id) -> balance
    balances: Mutex<BTreeMap<(String, String), u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn increment(&self, miner_id: &str, address: &str, amount: u64) -> Result<()> {
        let mut balances = self.balances.lock();
        let balance = balances
            .entry((address.to_string(), miner_id.to_string()))
            .or_default();
        *balance = balance.saturating_add(amount);
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<Balance>> {
        Ok(self
            .balances
            .lock()
            .iter()
            .map(|((address, miner_id), balance)| Balance {
                miner_id: miner_id.clone(),
                address: address.clone(),
                balance: *balance,
            })
            .collect())
    }
}
