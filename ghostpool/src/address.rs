//! Kaspa wallet address validation.
//!
//! Addresses are `prefix:payload` where the payload is base32 (cashaddr
//! alphabet) and ends in a 40-bit BCH checksum covering both the prefix and
//! the payload. Miners authorize with `address.worker`, and an address that
//! fails this check is a protocol violation.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const CHECKSUM_LEN: usize = 8;

/// Network an address belongs to, identified by its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Simnet,
    Devnet,
}

impl Network {
    /// Human-readable address prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            Network::Mainnet => "kaspa",
            Network::Testnet => "kaspatest",
            Network::Simnet => "kaspasim",
            Network::Devnet => "kaspadev",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "kaspa" => Some(Network::Mainnet),
            "kaspatest" => Some(Network::Testnet),
            "kaspasim" => Some(Network::Simnet),
            "kaspadev" => Some(Network::Devnet),
            _ => None,
        }
    }
}

/// Reasons an address string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address has no network prefix")]
    MissingPrefix,

    #[error("unknown address prefix '{0}'")]
    UnknownPrefix(String),

    #[error("invalid character '{0}' in address payload")]
    InvalidCharacter(char),

    #[error("address payload too short")]
    TooShort,

    #[error("address checksum mismatch")]
    BadChecksum,
}

/// A checksum-validated Kaspa address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    network: Network,
    encoded: String,
}

impl Address {
    /// Network the address belongs to.
    pub fn network(&self) -> Network {
        self.network
    }

    /// The address as given, `prefix:payload`.
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Whether `s` is a well-formed address with a valid checksum.
    pub fn validate(s: &str) -> bool {
        s.parse::<Address>().is_ok()
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, payload) = s.split_once(':').ok_or(AddressError::MissingPrefix)?;
        let network = Network::from_prefix(prefix)
            .ok_or_else(|| AddressError::UnknownPrefix(prefix.to_string()))?;

        let values = payload
            .chars()
            .map(|c| {
                CHARSET
                    .iter()
                    .position(|&b| char::from(b) == c)
                    .map(|v| v as u8)
                    .ok_or(AddressError::InvalidCharacter(c))
            })
            .collect::<Result<Vec<u8>, _>>()?;
        if values.len() <= CHECKSUM_LEN {
            return Err(AddressError::TooShort);
        }

        let checksum_input = prefix
            .bytes()
            .map(|b| b & 0x1f)
            .chain(std::iter::once(0))
            .chain(values.iter().copied());
        if polymod(checksum_input) != 0 {
            return Err(AddressError::BadChecksum);
        }

        Ok(Self {
            network,
            encoded: s.to_string(),
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

// BCH checksum over 5-bit values. A valid address (checksum included)
// evaluates to zero.
fn polymod(values: impl Iterator<Item = u8>) -> u64 {
    const GENERATORS: [u64; 5] = [
        0x98_f2bc_8e61,
        0x79_b76d_99e2,
        0xf3_3e5f_b3c4,
        0xae_2eab_e2a8,
        0x1e_4f43_e470,
    ];

    let mut c: u64 = 1;
    for d in values {
        let c0 = c >> 35;
        c = ((c & 0x07_ffff_ffff) << 5) ^ u64::from(d);
        for (bit, generator) in GENERATORS.iter().enumerate() {
            if c0 & (1 << bit) != 0 {
                c ^= generator;
            }
        }
    }
    c ^ 1
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use test_case::test_case;

    pub(crate) const MAINNET_A: &str =
        "kaspa:qqqsyqcyq5rqwzqfpg9scrgwpugpzysnzs23v9ccrydpk8qarc0jqsxdsp6jf";
    pub(crate) const MAINNET_B: &str =
        "kaspa:qz46h2at4w46h2at4w46h2at4w46h2at4w46h2at4w46h2at4w46kw2zgyepf";
    pub(crate) const TESTNET_A: &str =
        "kaspatest:qqqsyqcyq5rqwzqfpg9scrgwpugpzysnzs23v9ccrydpk8qarc0jq3qttwyrd";

    #[test_case(MAINNET_A, Network::Mainnet)]
    #[test_case(MAINNET_B, Network::Mainnet)]
    #[test_case(TESTNET_A, Network::Testnet)]
    #[test_case(
        "kaspa:qyppkat8emnevrdtnu4hkkc6dmwj4xwmfh9ne3ncng49azgta7sg0ncrthn2erh",
        Network::Mainnet
    )]
    fn test_valid_addresses(s: &str, network: Network) {
        let address: Address = s.parse().unwrap();
        assert_eq!(address.network(), network);
        assert_eq!(address.as_str(), s);
        assert!(Address::validate(s));
    }

    #[test]
    fn test_checksum_covers_payload() {
        let mut tampered = MAINNET_A.to_string();
        tampered.pop();
        tampered.push('q');
        assert_eq!(tampered.parse::<Address>(), Err(AddressError::BadChecksum));
    }

    #[test]
    fn test_checksum_covers_prefix() {
        // Same payload as a valid testnet address, wrong network
        let swapped = TESTNET_A.replacen("kaspatest:", "kaspa:", 1);
        assert_eq!(swapped.parse::<Address>(), Err(AddressError::BadChecksum));
    }

    #[test_case("qqqsyqcyq5rqwzqfpg9scrgwpugpzysnzs23v", AddressError::MissingPrefix)]
    #[test_case("bitcoin:qqqsyqcyq", AddressError::UnknownPrefix("bitcoin".into()))]
    #[test_case("kaspa:qqqb", AddressError::InvalidCharacter('b'))]
    #[test_case("kaspa:qqqq", AddressError::TooShort)]
    fn test_malformed_addresses(s: &str, expected: AddressError) {
        assert_eq!(s.parse::<Address>(), Err(expected));
        assert!(!Address::validate(s));
    }
}
