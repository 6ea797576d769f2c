//! kHeavyHash proof of work.
//!
//! Per template we derive the pre-PoW hash, a 64x64 matrix of 4-bit values
//! seeded from it, and a cSHAKE256 state absorbed up to the nonce. Checking a
//! nonce then costs one hash finalization, one matrix-vector product and one
//! more hash.
//!
//! ```text
//! pow_hash = cSHAKE256("ProofOfWorkHash", pre_pow || timestamp || 0^32 || nonce)
//! product  = (M * nibbles(pow_hash)) >> 10, packed back to bytes, xor pow_hash
//! pow      = cSHAKE256("HeavyHash", product), read as little-endian U256
//! ```

use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{CShake256, CShake256Core};

use super::header::{BlockHeader, Hash};
use crate::u256::U256;

const POW_DOMAIN: &[u8] = b"ProofOfWorkHash";
const HEAVY_HASH_DOMAIN: &[u8] = b"HeavyHash";

const MATRIX_SIZE: usize = 64;

/// Proof-of-work state for one template.
#[derive(Clone)]
pub struct PowState {
    pre_pow_hash: Hash,
    timestamp: u64,
    target: U256,
    matrix: Matrix,
    hasher: CShake256,
}

impl PowState {
    /// Derive the state from a template header.
    pub fn new(header: &BlockHeader) -> Self {
        let pre_pow_hash = header.pre_pow_hash();
        let mut hasher = CShake256::from_core(CShake256Core::new(POW_DOMAIN));
        hasher.update(pre_pow_hash.as_bytes());
        hasher.update(&header.timestamp.to_le_bytes());
        hasher.update(&[0u8; 32]);

        Self {
            pre_pow_hash,
            timestamp: header.timestamp,
            target: U256::from_compact(header.bits),
            matrix: Matrix::generate(&pre_pow_hash),
            hasher,
        }
    }

    pub fn pre_pow_hash(&self) -> &Hash {
        &self.pre_pow_hash
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Proof-of-work value for a nonce. Lower is better.
    pub fn calculate_pow(&self, nonce: u64) -> U256 {
        let mut hasher = self.hasher.clone();
        hasher.update(&nonce.to_le_bytes());
        let pow_hash = read_32(hasher);
        U256::from_le_bytes(self.matrix.heavy_hash(&pow_hash))
    }

    /// Returns whether the nonce solves the block, and the achieved value.
    pub fn check_work(&self, nonce: u64) -> (bool, U256) {
        let pow = self.calculate_pow(nonce);
        (pow <= self.target, pow)
    }
}

impl std::fmt::Debug for PowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowState")
            .field("pre_pow_hash", &self.pre_pow_hash)
            .field("timestamp", &self.timestamp)
            .field("target", &format_args!("{:x}", self.target))
            .finish_non_exhaustive()
    }
}

fn read_32(hasher: CShake256) -> [u8; 32] {
    let mut out = [0u8; 32];
    hasher.finalize_xof().read(&mut out);
    out
}

#[derive(Clone)]
struct Matrix(Box<[[u16; MATRIX_SIZE]; MATRIX_SIZE]>);

impl Matrix {
    /// Draw matrices from the seeded generator until one has full rank.
    fn generate(seed: &Hash) -> Self {
        let mut rng = XoShiRo256PlusPlus::new(seed);
        loop {
            let matrix = Self::random(&mut rng);
            if matrix.rank() == MATRIX_SIZE {
                return matrix;
            }
        }
    }

    fn random(rng: &mut XoShiRo256PlusPlus) -> Self {
        let mut rows = Box::new([[0u16; MATRIX_SIZE]; MATRIX_SIZE]);
        for row in rows.iter_mut() {
            let mut word = 0u64;
            for (j, cell) in row.iter_mut().enumerate() {
                let shift = j % 16;
                if shift == 0 {
                    word = rng.next_u64();
                }
                *cell = ((word >> (4 * shift)) & 0x0f) as u16;
            }
        }
        Self(rows)
    }

    // Gaussian elimination over f64. Entries are small integers so the
    // epsilon comparison is exact enough to decide rank.
    fn rank(&self) -> usize {
        const EPS: f64 = 1e-9;

        let mut m = [[0f64; MATRIX_SIZE]; MATRIX_SIZE];
        for (dst, src) in m.iter_mut().zip(self.0.iter()) {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d = f64::from(*s);
            }
        }

        let mut rank = 0;
        let mut selected = [false; MATRIX_SIZE];
        for col in 0..MATRIX_SIZE {
            let Some(pivot) = (0..MATRIX_SIZE).find(|&r| !selected[r] && m[r][col].abs() > EPS)
            else {
                continue;
            };
            rank += 1;
            selected[pivot] = true;

            let lead = m[pivot][col];
            for p in (col + 1)..MATRIX_SIZE {
                m[pivot][p] /= lead;
            }
            let pivot_row = m[pivot];
            for (r, row) in m.iter_mut().enumerate() {
                let factor = row[col];
                if r != pivot && factor.abs() > EPS {
                    for p in (col + 1)..MATRIX_SIZE {
                        row[p] -= pivot_row[p] * factor;
                    }
                }
            }
        }
        rank
    }

    fn heavy_hash(&self, hash: &[u8; 32]) -> [u8; 32] {
        let mut nibbles = [0u16; MATRIX_SIZE];
        for (i, byte) in hash.iter().enumerate() {
            nibbles[2 * i] = u16::from(byte >> 4);
            nibbles[2 * i + 1] = u16::from(byte & 0x0f);
        }

        let mut product = [0u8; 32];
        for (i, out) in product.iter_mut().enumerate() {
            let dot = |row: &[u16; MATRIX_SIZE]| -> u16 {
                row.iter().zip(nibbles.iter()).map(|(a, b)| a * b).sum()
            };
            let high = dot(&self.0[2 * i]) >> 10;
            let low = dot(&self.0[2 * i + 1]) >> 10;
            *out = (((high << 4) | low) as u8) ^ hash[i];
        }

        let mut hasher = CShake256::from_core(CShake256Core::new(HEAVY_HASH_DOMAIN));
        hasher.update(&product);
        read_32(hasher)
    }
}

/// xoshiro256++ seeded with the four little-endian words of a hash.
struct XoShiRo256PlusPlus([u64; 4]);

impl XoShiRo256PlusPlus {
    fn new(seed: &Hash) -> Self {
        Self(seed.to_le_u64())
    }

    fn next_u64(&mut self) -> u64 {
        let [s0, s1, s2, s3] = &mut self.0;
        let result = s0.wrapping_add(*s3).rotate_left(23).wrapping_add(*s0);
        let t = *s1 << 17;
        *s2 ^= *s0;
        *s3 ^= *s1;
        *s1 ^= *s2;
        *s0 ^= *s3;
        *s2 ^= t;
        *s3 = s3.rotate_left(45);
        result
    }
}
