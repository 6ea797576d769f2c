//! Kaspa block header and template types, plus header hashing.
//!
//! The header hash is a Blake2b-256 keyed with the literal `"BlockHash"`
//! over a fixed little-endian serialization of the header. The same
//! serialization with timestamp and nonce zeroed gives the pre-PoW hash that
//! miners work on.

use std::fmt;
use std::str::FromStr;

use blake2::digest::{consts::U32, Mac};
use blake2::Blake2bMac;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

const BLOCK_HASH_KEY: &[u8] = b"BlockHash";

/// A 32-byte hash, displayed and serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The hash as four little-endian 64-bit words.
    pub fn to_le_u64(&self) -> [u64; 4] {
        let mut words = [0u64; 4];
        for (word, chunk) in words.iter_mut().zip(self.0.chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *word = u64::from_le_bytes(bytes);
        }
        words
    }

    /// Inverse of [`Hash::to_le_u64`].
    pub fn from_le_u64(words: [u64; 4]) -> Self {
        let mut bytes = [0u8; 32];
        for (chunk, word) in bytes.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Self(bytes)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

impl FromStr for Hash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Accumulated blue work, a big-endian integer of arbitrary width.
///
/// Nodes send it as hex without a fixed width, so an odd number of digits
/// is common; it is left-padded with one zero nibble before decoding.
/// Leading zero bytes are dropped because the hash serialization writes the
/// minimal big-endian form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlueWork(Vec<u8>);

impl BlueWork {
    /// Minimal big-endian bytes.
    pub fn as_be_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for BlueWork {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes = if digits.len() % 2 == 1 {
            hex::decode(format!("0{digits}"))?
        } else {
            hex::decode(digits)?
        };
        let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        Ok(Self(bytes[first..].to_vec()))
    }
}

impl fmt::Display for BlueWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = hex::encode(&self.0);
        let trimmed = digits.trim_start_matches('0');
        f.write_str(if trimmed.is_empty() { "0" } else { trimmed })
    }
}

impl Serialize for BlueWork {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlueWork {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Kaspa block header as delivered by the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub version: u16,
    pub parents_by_level: Vec<Vec<Hash>>,
    pub hash_merkle_root: Hash,
    pub accepted_id_merkle_root: Hash,
    pub utxo_commitment: Hash,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub bits: u32,
    pub nonce: u64,
    pub daa_score: u64,
    pub blue_work: BlueWork,
    pub blue_score: u64,
    pub pruning_point: Hash,
}

impl BlockHeader {
    /// Header hash, identifying the template.
    pub fn hash(&self) -> Hash {
        self.digest(self.timestamp, self.nonce)
    }

    /// Hash with timestamp and nonce zeroed; the value miners search over.
    pub fn pre_pow_hash(&self) -> Hash {
        self.digest(0, 0)
    }

    fn digest(&self, timestamp: u64, nonce: u64) -> Hash {
        let mut hasher = HeaderHasher::new();
        hasher.write_u16(self.version);
        hasher.write_len(self.parents_by_level.len());
        for level in &self.parents_by_level {
            hasher.write_len(level.len());
            for parent in level {
                hasher.write_hash(parent);
            }
        }
        hasher.write_hash(&self.hash_merkle_root);
        hasher.write_hash(&self.accepted_id_merkle_root);
        hasher.write_hash(&self.utxo_commitment);
        hasher.write_u64(timestamp);
        hasher.write_u32(self.bits);
        hasher.write_u64(nonce);
        hasher.write_u64(self.daa_score);
        hasher.write_u64(self.blue_score);
        hasher.write_var_bytes(self.blue_work.as_be_bytes());
        hasher.write_hash(&self.pruning_point);
        hasher.finalize()
    }
}

/// A node block template: header plus the transactions to submit with it.
///
/// Transactions are opaque to the pool and passed back to the node
/// untouched on block submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockTemplate {
    pub header: BlockHeader,
    #[serde(default)]
    pub transactions: Vec<Value>,
}

struct HeaderHasher(Blake2bMac<U32>);

impl HeaderHasher {
    fn new() -> Self {
        // The key is a nine-byte constant, always within blake2b's 64-byte limit.
        Self(Blake2bMac::new_from_slice(BLOCK_HASH_KEY).expect("BlockHash key fits blake2b"))
    }

    fn write_u16(&mut self, value: u16) {
        self.0.update(&value.to_le_bytes());
    }

    fn write_u32(&mut self, value: u32) {
        self.0.update(&value.to_le_bytes());
    }

    fn write_u64(&mut self, value: u64) {
        self.0.update(&value.to_le_bytes());
    }

    fn write_len(&mut self, len: usize) {
        self.write_u64(len as u64);
    }

    fn write_hash(&mut self, hash: &Hash) {
        self.0.update(hash.as_bytes());
    }

    fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_len(bytes.len());
        self.0.update(bytes);
    }

    fn finalize(self) -> Hash {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0.finalize().into_bytes());
        Hash(out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Header with two single-parent levels and fixed roots.
    pub(crate) fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            parents_by_level: vec![
                vec![Hash::from_bytes([0xaa; 32])],
                vec![Hash::from_bytes([0xbb; 32])],
            ],
            hash_merkle_root: Hash::from_bytes([0x11; 32]),
            accepted_id_merkle_root: Hash::from_bytes([0x22; 32]),
            utxo_commitment: Hash::from_bytes([0x33; 32]),
            timestamp: 1_700_000_000_000,
            bits: 0x1e7f_ffff,
            nonce: 0x0123_4567_89ab_cdef,
            daa_score: 1000,
            blue_work: "1e240".parse().unwrap(),
            blue_score: 900,
            pruning_point: Hash::from_bytes([0x44; 32]),
        }
    }

    #[test]
    fn test_header_hash_vector() {
        let header = sample_header();
        assert_eq!(
            header.hash().to_string(),
            "7709b030570310c52edda3b9bdf74c8061cc3bc6b80b795153cf64632c8fef4d"
        );
        assert_eq!(
            header.pre_pow_hash().to_string(),
            "f8f146f142efcdba368ca61c58fc124865a4385227d919370cced0e37e24b85b"
        );
    }

    #[test]
    fn test_pre_pow_hash_ignores_timestamp_and_nonce() {
        let header = sample_header();
        let mut rolled = header.clone();
        rolled.timestamp += 1;
        rolled.nonce = 7;
        assert_eq!(header.pre_pow_hash(), rolled.pre_pow_hash());
        assert_ne!(header.hash(), rolled.hash());
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(sample_header().hash(), sample_header().hash());
    }

    #[test]
    fn test_blue_work_padding() {
        let odd: BlueWork = "1e240".parse().unwrap();
        let even: BlueWork = "01e240".parse().unwrap();
        let padded: BlueWork = "00001e240".parse().unwrap();
        assert_eq!(odd.as_be_bytes(), &[0x01, 0xe2, 0x40]);
        assert_eq!(odd, even);
        assert_eq!(odd, padded);
        assert_eq!(odd.to_string(), "1e240");
        assert_eq!(BlueWork::default().to_string(), "0");
        assert!("xyz".parse::<BlueWork>().is_err());
    }

    #[test]
    fn test_hash_words() {
        let hash = Hash::from_bytes(std::array::from_fn(|i| i as u8));
        let words = hash.to_le_u64();
        assert_eq!(words[0], 0x0706_0504_0302_0100);
        assert_eq!(Hash::from_le_u64(words), hash);
    }

    #[test]
    fn test_template_json() {
        let aa = "aa".repeat(32);
        let value = json!({
            "header": {
                "version": 1,
                "parentsByLevel": [[aa]],
                "hashMerkleRoot": "11".repeat(32),
                "acceptedIdMerkleRoot": "22".repeat(32),
                "utxoCommitment": "33".repeat(32),
                "timestamp": 5,
                "bits": 486604799u32,
                "nonce": 0,
                "daaScore": 10,
                "blueWork": "abc",
                "blueScore": 9,
                "pruningPoint": "44".repeat(32)
            },
            "transactions": [{"version": 0}]
        });

        let template: BlockTemplate = serde_json::from_value(value).unwrap();
        assert_eq!(template.header.parents_by_level[0][0], Hash::from_bytes([0xaa; 32]));
        assert_eq!(template.header.blue_work.as_be_bytes(), &[0x0a, 0xbc]);
        assert_eq!(template.transactions.len(), 1);

        let back = serde_json::to_value(&template).unwrap();
        assert_eq!(back["header"]["blueWork"], "abc");
        assert_eq!(back["header"]["hashMerkleRoot"], "11".repeat(32));
    }

    #[test]
    fn test_hash_rejects_wrong_length() {
        assert!("aa".parse::<Hash>().is_err());
        assert!("zz".repeat(32).parse::<Hash>().is_err());
    }
}
