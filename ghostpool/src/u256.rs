//! 256-bit unsigned integer arithmetic.
//!
//! Wraps `ruint::aliases::U256` to provide a stable interface for targets
//! and proof-of-work values. This adapter module exists so we can swap the
//! underlying library without changing callers.

use ruint::aliases::{U256 as Ruint256, U512};
use std::fmt;
use std::ops::{Add, Div, Mul, Shl, Shr};

/// A 256-bit unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct U256(Ruint256);

impl U256 {
    /// Zero constant.
    pub const ZERO: Self = Self(Ruint256::ZERO);

    /// Largest representable value.
    pub const MAX: Self = Self(Ruint256::MAX);

    /// Number of bits.
    pub const BITS: usize = 256;

    /// Create from little-endian bytes.
    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_le_bytes(bytes))
    }

    /// Convert to little-endian bytes.
    pub fn to_le_bytes(self) -> [u8; 32] {
        self.0.to_le_bytes()
    }

    /// Expand a compact ("bits") target representation.
    ///
    /// The mantissa is the low 24 bits, the exponent the high byte, giving
    /// `mantissa * 256^(exponent - 3)`. A mantissa with the sign bit set
    /// encodes a negative number, which is never a valid target, so it
    /// expands to zero. Exponents that would overflow saturate at `MAX`.
    pub fn from_compact(bits: u32) -> Self {
        let exponent = (bits >> 24) as usize;
        let mantissa = bits & 0x00ff_ffff;
        if mantissa > 0x007f_ffff {
            return Self::ZERO;
        }

        let mantissa = Self::from(u64::from(mantissa));
        if exponent <= 3 {
            mantissa >> (8 * (3 - exponent))
        } else {
            mantissa.saturating_shl(8 * (exponent - 3))
        }
    }

    /// Number of significant bits.
    pub fn bit_len(self) -> usize {
        self.0.bit_len()
    }

    /// Shift left, saturating at `MAX` instead of discarding high bits.
    pub fn saturating_shl(self, shift: usize) -> Self {
        if self == Self::ZERO {
            return self;
        }
        if self.bit_len() + shift > Self::BITS {
            return Self::MAX;
        }
        Self(self.0 << shift)
    }

    /// Compute `(self << shift) / divisor` without losing the shifted-out
    /// bits, saturating at `MAX` when the quotient needs more than 256 bits.
    ///
    /// # Panics
    /// Panics if `divisor` is zero.
    pub fn shl_div(self, shift: usize, divisor: Self) -> Self {
        if self.bit_len() + shift > 512 {
            return Self::MAX;
        }
        let wide = U512::from_le_slice(&self.to_le_bytes()) << shift;
        let quotient = wide / U512::from_le_slice(&divisor.to_le_bytes());
        if quotient.bit_len() > Self::BITS {
            return Self::MAX;
        }
        let bytes: [u8; 64] = quotient.to_le_bytes();
        let mut low = [0u8; 32];
        low.copy_from_slice(&bytes[..32]);
        Self::from_le_bytes(low)
    }

    /// Convert to u64, saturating at u64::MAX.
    pub fn saturating_to_u64(self) -> u64 {
        self.0.saturating_to()
    }

    /// Lossy conversion to f64, for display and ratios.
    pub fn to_f64(self) -> f64 {
        self.to_le_bytes()
            .iter()
            .rev()
            .fold(0.0, |acc, byte| acc * 256.0 + f64::from(*byte))
    }
}

impl From<u64> for U256 {
    fn from(value: u64) -> Self {
        Self(Ruint256::from(value))
    }
}

impl From<u128> for U256 {
    fn from(value: u128) -> Self {
        Self(Ruint256::from(value))
    }
}

impl Div for U256 {
    type Output = Self;

    fn div(self, rhs: Self) -> Self::Output {
        Self(self.0 / rhs.0)
    }
}

impl Add for U256 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Mul for U256 {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self::Output {
        Self(self.0 * rhs.0)
    }
}

impl Shl<usize> for U256 {
    type Output = Self;

    fn shl(self, rhs: usize) -> Self::Output {
        Self(self.0 << rhs)
    }
}

impl Shr<usize> for U256 {
    type Output = Self;

    fn shr(self, rhs: usize) -> Self::Output {
        Self(self.0 >> rhs)
    }
}

impl fmt::LowerHex for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let be: Vec<u8> = self.to_le_bytes().iter().rev().copied().collect();
        write!(f, "{}", hex::encode(be))
    }
}
