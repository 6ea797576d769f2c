//! Share difficulty type.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::u256::U256;

/// Bit position of the difficulty-1 target: `MAX_TARGET = 2^224 - 1`.
const MAX_TARGET_BITS: usize = 224;

/// Largest target, corresponding to difficulty 1.
pub fn max_target() -> U256 {
    U256::MAX >> (U256::BITS - MAX_TARGET_BITS)
}

/// Pool share difficulty.
///
/// Kaspa pools hand out fractional difficulties, so unlike block `bits`
/// this is a float. Difficulty and target are inversely related:
/// ```text
/// target = MAX_TARGET / difficulty
/// ```
///
/// A share meets difficulty `d` when its proof-of-work value, read as a
/// little-endian 256-bit integer, is at most `d.to_target()`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Difficulty(f64);

impl Difficulty {
    /// Create a new difficulty value.
    pub const fn new(value: f64) -> Self {
        Self(value)
    }

    /// Raw difficulty value.
    pub const fn as_f64(self) -> f64 {
        self.0
    }

    /// Convert difficulty to a 256-bit target.
    ///
    /// The difficulty is split into `m * 2^e` with an integer `m`, so the
    /// result is `floor(MAX_TARGET * 2^-e / m)` computed exactly in wide
    /// integer arithmetic. Tiny difficulties whose target exceeds 256 bits
    /// saturate at `U256::MAX`. Non-positive or non-finite difficulties map
    /// to the difficulty-1 target.
    pub fn to_target(self) -> U256 {
        if !(self.0.is_finite() && self.0 > 0.0) {
            return max_target();
        }

        let (mantissa, exponent) = decompose(self.0);
        if exponent > 0 {
            (max_target() / mantissa) >> (exponent as usize)
        } else {
            max_target().shl_div(exponent.unsigned_abs() as usize, mantissa)
        }
    }

    /// Difficulty that a proof-of-work value would satisfy exactly.
    ///
    /// Used for logging how good a share was. Zero maps to `f64::MAX`.
    pub fn from_target(target: U256) -> Self {
        if target == U256::ZERO {
            return Self(f64::MAX);
        }
        Self(max_target().to_f64() / target.to_f64())
    }

    /// Multiply by a ratio, used when rescaling.
    pub fn scaled(self, ratio: f64) -> Self {
        Self(self.0 * ratio)
    }

    /// Round down to a power of two.
    pub fn floor_pow2(self) -> Self {
        if self.0 <= 0.0 {
            return self;
        }
        Self(2f64.powf(self.0.log2().floor()))
    }

    /// Clamp into `[min, max]`.
    pub fn clamp(self, min: Difficulty, max: Difficulty) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }
}

// Split a positive finite f64 into an integer mantissa and binary exponent.
fn decompose(value: f64) -> (U256, i32) {
    let bits = value.to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    let fraction = bits & ((1u64 << 52) - 1);
    if biased == 0 {
        (U256::from(fraction), -1074)
    } else {
        (U256::from(fraction | (1u64 << 52)), biased - 1075)
    }
}

impl From<f64> for Difficulty {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl From<Difficulty> for f64 {
    fn from(diff: Difficulty) -> Self {
        diff.0
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;

        // Format with SI suffixes (K, M, G, T, P)
        let (scaled, suffix) = if value >= 1e15 {
            (value / 1e15, "P")
        } else if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            (value, "")
        };

        if scaled >= 100.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_difficulty_one_is_max_target() {
        assert_eq!(Difficulty::new(1.0).to_target(), max_target());
        assert_eq!(max_target().bit_len(), 224);
    }

    #[test]
    fn test_degenerate_difficulties() {
        assert_eq!(Difficulty::new(0.0).to_target(), max_target());
        assert_eq!(Difficulty::new(-5.0).to_target(), max_target());
        assert_eq!(Difficulty::new(f64::NAN).to_target(), max_target());
    }

    #[test_case(2.0, 1)]
    #[test_case(1024.0, 10)]
    #[test_case(65536.0, 16)]
    fn test_power_of_two_difficulty_shifts_target(difficulty: f64, shift: usize) {
        assert_eq!(Difficulty::new(difficulty).to_target(), max_target() >> shift);
    }

    #[test]
    fn test_fractional_difficulty() {
        // Half difficulty doubles the target (plus the low bit of 2^224 - 1)
        let target = Difficulty::new(0.5).to_target();
        assert_eq!(target.bit_len(), 225);
        assert!(target > max_target());
    }

    #[test]
    fn test_tiny_difficulty_saturates() {
        assert_eq!(Difficulty::new(1e-30).to_target(), U256::MAX);
    }

    #[test]
    fn test_target_monotonic() {
        let low = Difficulty::new(100.0).to_target();
        let mid = Difficulty::new(1000.0).to_target();
        let high = Difficulty::new(1000.5).to_target();
        assert!(mid < low);
        assert!(high < mid);
    }

    #[test]
    fn test_from_target_roundtrip() {
        let recovered = Difficulty::from_target(Difficulty::new(4096.0).to_target());
        assert!((recovered.as_f64() - 4096.0).abs() < 1e-6);
        assert_eq!(Difficulty::from_target(U256::ZERO).as_f64(), f64::MAX);
    }

    #[test]
    fn test_floor_pow2_and_clamp() {
        assert_eq!(Difficulty::new(3000.0).floor_pow2(), Difficulty::new(2048.0));
        assert_eq!(Difficulty::new(4096.0).floor_pow2(), Difficulty::new(4096.0));
        assert_eq!(Difficulty::new(0.3).floor_pow2(), Difficulty::new(0.25));

        let clamped = Difficulty::new(1e9).clamp(Difficulty::new(1.0), Difficulty::new(1e6));
        assert_eq!(clamped, Difficulty::new(1e6));
    }

    #[test]
    fn test_difficulty_display() {
        assert_eq!(Difficulty::new(1.5e15).to_string(), "1.50P");
        assert_eq!(Difficulty::new(11.2e12).to_string(), "11.2T");
        assert_eq!(Difficulty::new(500e9).to_string(), "500G");
        assert_eq!(Difficulty::new(4096.0).to_string(), "4.10K");
        assert_eq!(Difficulty::new(0.5).to_string(), "0.50");
    }
}
