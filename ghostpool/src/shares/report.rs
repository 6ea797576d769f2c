//! Pool statistics snapshots.
//!
//! These types cross the engine boundary: the API serves them as JSON, the
//! CLI reads them back, and the engine logs them as a table every ten
//! minutes.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::types::{Difficulty, HashRate};

/// One worker's statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub address: String,
    pub worker: String,
    pub encoding: String,
    pub difficulty: Difficulty,
    pub hashrate: HashRate,
    pub shares: u64,
    pub stale: u64,
    pub invalid: u64,
    pub duplicate: u64,
    pub jobs_not_found: u64,
    pub blocks: u64,
    pub uptime_secs: u64,
    /// Seconds since the last accepted share, if any.
    pub last_share_secs: Option<u64>,
}

/// Whole-pool statistics.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub uptime_secs: u64,
    pub hashrate: HashRate,
    pub miners: usize,
    pub connections: usize,
    pub live_templates: usize,
    pub pending_contributions: usize,
    /// Contributions discarded because the allocator fell behind.
    pub dropped_contributions: u64,
    pub workers: Vec<WorkerSummary>,
}

impl PoolStats {
    /// Accepted, stale and invalid share totals.
    pub fn totals(&self) -> (u64, u64, u64) {
        self.workers.iter().fold((0, 0, 0), |(acc, stl, inv), w| {
            (acc + w.shares, stl + w.stale, inv + w.invalid)
        })
    }

    pub fn blocks(&self) -> u64 {
        self.workers.iter().map(|w| w.blocks).sum()
    }
}

const RULE: &str =
    "===============================================================================";
const THIN_RULE: &str =
    "-------------------------------------------------------------------------------";

/// Render the periodic worker table.
pub fn render_table(stats: &PoolStats) -> String {
    let mut lines: Vec<String> = stats
        .workers
        .iter()
        .map(|w| {
            format!(
                " {:<15}| {:<14} | {:<14} | {:<12} | {}s",
                w.worker,
                w.hashrate.to_string(),
                format!("{}/{}/{}", w.shares, w.stale, w.invalid),
                w.blocks,
                w.uptime_secs
            )
        })
        .collect();
    lines.sort();

    let (acc, stl, inv) = stats.totals();
    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = writeln!(out);
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(
        out,
        "  worker name   |  avg hashrate  |   acc/stl/inv  |    blocks    |    uptime   "
    );
    let _ = writeln!(out, "{THIN_RULE}");
    for line in &lines {
        let _ = writeln!(out, "{line}");
    }
    let _ = writeln!(out, "{THIN_RULE}");
    let _ = writeln!(
        out,
        "                | {:<14} | {:<14} | {:<12} | {}s",
        stats.hashrate.to_string(),
        format!("{acc}/{stl}/{inv}"),
        stats.blocks(),
        stats.uptime_secs
    );
    let _ = write!(out, "{RULE}");
    out
}
