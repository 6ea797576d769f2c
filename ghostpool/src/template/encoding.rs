//! Job parameter encodings for `mining.notify`.
//!
//! Miner firmware disagrees on how the work should be presented. General
//! purpose miners take one hex string, while ASIC firmware wants the pre-PoW
//! hash as four 64-bit words and the timestamp as a separate number. The
//! encoding is chosen once per connection from the client identity it sends
//! in `mining.subscribe`.

use regex::Regex;
use serde_json::{json, Value};
use strum::{Display, EnumIter};

use super::header::Hash;

/// Wire encoding of job parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Encoding {
    /// `hex(pre_pow_hash) || hex(timestamp as u64 LE)` in a single string.
    #[default]
    Generic,
    /// `[[w0, w1, w2, w3], timestamp]` with `wN` the little-endian words of
    /// the pre-PoW hash.
    Asic,
}

/// Encode job parameters (everything after the job ID).
pub fn encode_job(pre_pow_hash: &Hash, timestamp: u64, encoding: Encoding) -> Vec<Value> {
    match encoding {
        Encoding::Generic => {
            let mut work = pre_pow_hash.to_string();
            work.push_str(&hex::encode(timestamp.to_le_bytes()));
            vec![Value::String(work)]
        }
        Encoding::Asic => {
            let words = pre_pow_hash.to_le_u64();
            vec![json!(words), json!(timestamp)]
        }
    }
}

/// Selects an encoding from a client identity string.
#[derive(Debug, Clone, Default)]
pub struct IdentityMatcher {
    asic: Vec<Regex>,
}

impl IdentityMatcher {
    /// Build from regex patterns that identify ASIC firmware.
    pub fn new<S: AsRef<str>>(asic_patterns: &[S]) -> Result<Self, regex::Error> {
        let asic = asic_patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self { asic })
    }

    pub fn encoding_for(&self, identity: &str) -> Encoding {
        if self.asic.iter().any(|re| re.is_match(identity)) {
            Encoding::Asic
        } else {
            Encoding::Generic
        }
    }
}
