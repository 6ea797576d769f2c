//! Variable difficulty controller.
//!
//! Each worker is observed over a sequence of widening windows, all measured
//! from the worker's vardiff start. Early windows are short with loose
//! tolerances so a badly mistuned miner is corrected within a minute or two;
//! later windows are long and tight so a well-tuned miner is left alone.
//!
//! ```text
//! window (min)  1     3     10     30     60     240    final
//! tolerance     100%  50%   25%    15%    10%    10%    10%
//! ```
//!
//! With `ratio = observed share rate / expected share rate`:
//!
//! - in the final window any deviation of at least the tolerance rescales;
//! - a deviation breaching the tolerance of any window already cleared
//!   rescales;
//! - too many shares for the current window rescales immediately;
//! - once the current window has elapsed, too few shares rescales (by at
//!   least a factor of 0.1), otherwise the worker advances to the next one.
//!
//! A rescale multiplies the difficulty by the ratio, optionally rounds down to
//! a power of two, clamps to the configured bounds, and restarts observation
//! at the first window.

use tokio::time::Instant;

use super::stats::WorkerStats;
use crate::types::Difficulty;

/// Window lengths in minutes, excluding the open-ended final window.
pub const WINDOWS: [f64; 6] = [1.0, 3.0, 10.0, 30.0, 60.0, 240.0];

/// Tolerance per window, the last entry belonging to the final window.
pub const TOLERANCES: [f64; 7] = [1.0, 0.5, 0.25, 0.15, 0.1, 0.1, 0.1];

/// Index of the final, never-advancing window.
pub const FINAL_WINDOW: usize = WINDOWS.len();

/// Smallest downward factor applied when a window ends with too few shares.
const MIN_DOWNSCALE: f64 = 0.1;

/// Vardiff tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VardiffConfig {
    pub shares_per_minute: f64,
    pub min_difficulty: Difficulty,
    pub max_difficulty: Difficulty,
    pub clamp_pow2: bool,
}

/// Outcome of evaluating one worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Keep observing in the current window.
    Hold,
    /// The current window passed within tolerance.
    Advance,
    /// Multiply the difficulty by this factor.
    Rescale(f64),
}

/// Evaluate a worker's share count against the expected rate.
pub fn evaluate(window: usize, shares: u64, minutes: f64, shares_per_minute: f64) -> Decision {
    if minutes <= 0.0 || shares_per_minute <= 0.0 {
        return Decision::Hold;
    }

    let window = window.min(FINAL_WINDOW);
    let shares = shares as f64;
    let ratio = (shares / minutes) / shares_per_minute;
    let deviation = (1.0 - ratio).abs();
    let tolerance = TOLERANCES[window];

    if window == FINAL_WINDOW {
        return if deviation >= tolerance {
            Decision::Rescale(ratio)
        } else {
            Decision::Hold
        };
    }

    if TOLERANCES[1..=window].iter().any(|&cleared| deviation >= cleared) {
        return Decision::Rescale(ratio);
    }

    let expected = WINDOWS[window] * shares_per_minute;
    if shares >= expected * (1.0 + tolerance) {
        return Decision::Rescale(ratio);
    }

    if minutes >= WINDOWS[window] {
        if shares <= expected * (1.0 - tolerance) {
            return Decision::Rescale(ratio.max(MIN_DOWNSCALE));
        }
        return Decision::Advance;
    }

    Decision::Hold
}

/// Apply a rescale factor to a difficulty.
pub fn rescale(current: Difficulty, ratio: f64, config: &VardiffConfig) -> Difficulty {
    let mut next = current.scaled(ratio);
    if config.clamp_pow2 {
        next = next.floor_pow2();
    }
    next.clamp(config.min_difficulty, config.max_difficulty)
}

/// Run one vardiff step for a worker.
///
/// Returns the new difficulty when it changed; the worker's observation is
/// then restarted.
pub fn step(stats: &mut WorkerStats, now: Instant, config: &VardiffConfig) -> Option<Difficulty> {
    let minutes = now.saturating_duration_since(stats.vardiff_start).as_secs_f64() / 60.0;
    match evaluate(
        stats.vardiff_window,
        stats.vardiff_shares,
        minutes,
        config.shares_per_minute,
    ) {
        Decision::Hold => None,
        Decision::Advance => {
            stats.vardiff_window = (stats.vardiff_window + 1).min(FINAL_WINDOW);
            None
        }
        Decision::Rescale(ratio) => {
            let next = rescale(stats.min_diff, ratio, config);
            if next == stats.min_diff {
                return None;
            }
            stats.reset_vardiff(next, now);
            Some(next)
        }
    }
}
