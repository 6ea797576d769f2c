//! Core types for ghostpool.
//!
//! This module provides a unified location for small value types shared by
//! the share engine, the API and the CLI.

mod difficulty;

pub use difficulty::{max_target, Difficulty};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Expected hashes needed to find one share at difficulty 1 (2^32).
pub const HASHES_PER_DIFFICULTY: f64 = 4_294_967_296.0;

/// Hashrate measurement.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashRate(pub u64); // hashes per second

impl HashRate {
    /// Zero hashrate.
    pub const ZERO: Self = Self(0);

    /// Hashrate implied by finding `shares` shares of average difficulty
    /// `avg_difficulty` over `elapsed_secs` seconds.
    pub fn from_shares(avg_difficulty: f64, shares: f64, elapsed_secs: f64) -> Self {
        if elapsed_secs <= 0.0 {
            return Self::ZERO;
        }
        let rate = avg_difficulty * shares / elapsed_secs * HASHES_PER_DIFFICULTY;
        Self(rate.max(0.0) as u64)
    }

    /// Create from gigahashes per second
    pub fn from_gigahashes(gh: f64) -> Self {
        Self((gh * 1_000_000_000.0) as u64)
    }

    /// Get value as gigahashes per second
    pub fn as_gigahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Format as human-readable string with appropriate units
    pub fn to_human_readable(&self) -> String {
        const UNITS: [&str; 6] = ["kH/s", "MH/s", "GH/s", "TH/s", "PH/s", "EH/s"];
        let mut value = self.0 as f64;
        if value < 1000.0 {
            return format!("{} H/s", self.0);
        }
        let mut unit = UNITS[0];
        for candidate in UNITS {
            value /= 1000.0;
            unit = candidate;
            if value < 1000.0 {
                break;
            }
        }
        format!("{:.2} {}", value, unit)
    }
}

impl std::ops::Add for HashRate {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl std::iter::Sum for HashRate {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, rate| acc + rate)
    }
}

impl From<HashRate> for f64 {
    fn from(rate: HashRate) -> Self {
        rate.0 as f64
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_human_readable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashrate_from_shares() {
        // One difficulty-1 share per second is 2^32 H/s
        assert_eq!(HashRate::from_shares(1.0, 60.0, 60.0), HashRate(1 << 32));
        assert_eq!(HashRate::from_shares(1.0, 1.0, 0.0), HashRate::ZERO);
    }

    #[test]
    fn test_hashrate_human_readable() {
        assert_eq!(HashRate(999).to_human_readable(), "999 H/s");
        assert_eq!(HashRate(1_500).to_human_readable(), "1.50 kH/s");
        assert_eq!(HashRate::from_gigahashes(500.0).to_human_readable(), "500.00 GH/s");
        assert_eq!(HashRate(100_000_000_000_000).to_human_readable(), "100.00 TH/s");
        assert_eq!(HashRate(u64::MAX).to_human_readable(), "18.45 EH/s");
    }

    #[test]
    fn test_hashrate_sum() {
        let total: HashRate = [HashRate(1), HashRate(2), HashRate(u64::MAX)].into_iter().sum();
        assert_eq!(total, HashRate(u64::MAX));
        assert_eq!(HashRate::from_gigahashes(1.5).as_gigahashes(), 1.5);
    }
}
