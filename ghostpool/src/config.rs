//! Pool configuration.
//!
//! Configuration is a JSON file whose path comes from `GHOSTPOOL_CONFIG`
//! (default `config.json`). Every section and field has a default, so a
//! file only needs what differs. The treasury address has no usable default
//! and may instead be given in `TREASURY_ADDRESS`, which wins over the file.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::shares::{ShareConfig, VardiffConfig};
use crate::stratum::EngineConfig;
use crate::template::IdentityMatcher;
use crate::tracing::prelude::*;
use crate::types::Difficulty;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "GHOSTPOOL_CONFIG";

/// Environment variable overriding the treasury address.
pub const TREASURY_ADDRESS_ENV: &str = "TREASURY_ADDRESS";

const DEFAULT_PATH: &str = "config.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub treasury: TreasuryConfig,
    pub stratum: StratumConfig,
    pub pool: PoolConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// JSON-RPC endpoint of the node.
    pub url: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    /// Extra data placed in mined blocks.
    pub extra_data: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:16110".into(),
            poll_interval_ms: 500,
            request_timeout_ms: 5_000,
            extra_data: "ghostpool".into(),
        }
    }
}

impl NodeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreasuryConfig {
    /// Pool wallet: block rewards are paid here and the fee is credited here.
    pub address: String,
    /// Pool fee in percent of each coinbase reward.
    pub fee: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StratumConfig {
    pub listen: SocketAddr,
    /// Difficulty assigned to new workers.
    pub difficulty: f64,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
    pub shares_per_minute: f64,
    /// Round adjusted difficulties down to a power of two.
    pub clamp_pow2: bool,
    /// Log vardiff changes at info level.
    pub vardiff_stats: bool,
    /// Random extranonce bytes per connection, zero to disable.
    pub extranonce_size: usize,
    /// Client identity patterns that select the ASIC job encoding.
    pub asic_patterns: Vec<String>,
    /// Live templates kept for share validation.
    pub cache_size: usize,
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5555)),
            difficulty: 1024.0,
            min_difficulty: 1.0,
            max_difficulty: 1e12,
            shares_per_minute: 20.0,
            clamp_pow2: true,
            vardiff_stats: false,
            extranonce_size: 0,
            asic_patterns: vec![
                "(?i)bitmain".into(),
                "(?i)antminer".into(),
                "(?i)godminer".into(),
            ],
            cache_size: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How long share records and nonce dedupe entries are kept.
    pub window_secs: u64,
    /// Contributions kept for the allocator before the oldest are dropped.
    pub max_pending_contributions: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            window_secs: 600,
            max_pending_contributions: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9100)),
        }
    }
}

impl Config {
    /// Load from the file named by `GHOSTPOOL_CONFIG`, apply environment
    /// overrides and validate.
    ///
    /// A missing `config.json` in the working directory means defaults; a
    /// missing file named explicitly is an error.
    pub fn load() -> Result<Self> {
        let config = match env::var(CONFIG_ENV) {
            Ok(path) => Self::load_from(path)?,
            Err(_) if Path::new(DEFAULT_PATH).exists() => Self::load_from(DEFAULT_PATH)?,
            Err(_) => {
                info!(path = DEFAULT_PATH, "No configuration file, using defaults");
                Self::default()
            }
        };
        let config = config.with_overrides(|name| env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration file without overrides or validation.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = path.as_ref().into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let config = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply environment overrides, reading variables through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(address) = lookup(TREASURY_ADDRESS_ENV).filter(|a| !a.is_empty()) {
            self.treasury.address = address;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.treasury.address.is_empty() {
            return Err(Error::Config(format!(
                "treasury address missing (set treasury.address or {TREASURY_ADDRESS_ENV})"
            )));
        }
        self.treasury
            .address
            .parse::<Address>()
            .map_err(|e| Error::Config(format!("treasury address: {e}")))?;
        if !(0.0..=100.0).contains(&self.treasury.fee) {
            return Err(Error::Config(format!(
                "treasury fee {} outside 0-100%",
                self.treasury.fee
            )));
        }

        let s = &self.stratum;
        if s.cache_size == 0 {
            return Err(Error::Config("stratum cache size must be positive".into()));
        }
        if !(s.min_difficulty > 0.0 && s.min_difficulty <= s.max_difficulty) {
            return Err(Error::Config(format!(
                "difficulty bounds [{}, {}] are invalid",
                s.min_difficulty, s.max_difficulty
            )));
        }
        if !(s.min_difficulty..=s.max_difficulty).contains(&s.difficulty) {
            return Err(Error::Config(format!(
                "initial difficulty {} outside [{}, {}]",
                s.difficulty, s.min_difficulty, s.max_difficulty
            )));
        }
        if s.shares_per_minute <= 0.0 {
            return Err(Error::Config("shares per minute must be positive".into()));
        }
        if s.extranonce_size > 4 {
            return Err(Error::Config(format!(
                "extranonce size {} exceeds 4 bytes",
                s.extranonce_size
            )));
        }
        self.identities()?;

        if self.pool.window_secs == 0 {
            return Err(Error::Config("share window must be positive".into()));
        }
        if self.pool.max_pending_contributions == 0 {
            return Err(Error::Config(
                "max pending contributions must be positive".into(),
            ));
        }
        Ok(())
    }

    fn identities(&self) -> Result<IdentityMatcher> {
        IdentityMatcher::new(&self.stratum.asic_patterns)
            .map_err(|e| Error::Config(format!("ASIC pattern: {e}")))
    }

    /// Engine tuning derived from the stratum and pool sections.
    pub fn engine(&self) -> Result<EngineConfig> {
        let s = &self.stratum;
        Ok(EngineConfig {
            shares: ShareConfig {
                initial_difficulty: Difficulty::new(s.difficulty),
                window: Duration::from_secs(self.pool.window_secs),
                max_pending_contributions: self.pool.max_pending_contributions,
                vardiff: VardiffConfig {
                    shares_per_minute: s.shares_per_minute,
                    min_difficulty: Difficulty::new(s.min_difficulty),
                    max_difficulty: Difficulty::new(s.max_difficulty),
                    clamp_pow2: s.clamp_pow2,
                },
                vardiff_stats: s.vardiff_stats,
            },
            cache_size: s.cache_size,
            extranonce_size: s.extranonce_size,
            identities: self.identities()?,
            vardiff_interval: Duration::from_secs(10),
            hashrate_interval: Duration::from_secs(60),
            report_interval: Duration::from_secs(600),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::tests::{MAINNET_A, MAINNET_B};
    use crate::template::Encoding;
    use std::io::Write;

    fn valid() -> Config {
        let mut config = Config::default();
        config.treasury.address = MAINNET_A.into();
        config
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"treasury": {"fee": 2.5}, "stratum": {"listen": "0.0.0.0:7777", "difficulty": 64}}"#,
        )
        .unwrap();
        assert_eq!(config.treasury.fee, 2.5);
        assert_eq!(config.stratum.listen.port(), 7777);
        assert_eq!(config.stratum.difficulty, 64.0);
        assert_eq!(config.stratum.cache_size, 32);
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.api.listen.port(), 9100);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("ghostpool-config-{}.json", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"node": {{"url": "http://node:16110"}}}}"#).unwrap();
        drop(file);

        let config = Config::load_from(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.node.url, "http://node:16110");
        assert_eq!(config.node.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_from_missing_or_bad_file() {
        assert!(matches!(
            Config::load_from("/nonexistent/ghostpool.json"),
            Err(Error::Config(_))
        ));

        let path = std::env::temp_dir().join(format!("ghostpool-bad-{}.json", std::process::id()));
        std::fs::write(&path, "{ not json").unwrap();
        let result = Config::load_from(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_treasury_override() {
        let mut config = valid();
        config = config.with_overrides(|name| (name == TREASURY_ADDRESS_ENV).then(|| MAINNET_B.to_string()));
        assert_eq!(config.treasury.address, MAINNET_B);

        // Empty value is ignored
        config = config.with_overrides(|_| Some(String::new()));
        assert_eq!(config.treasury.address, MAINNET_B);
    }

    #[test]
    fn test_validate_accepts_defaults_with_address() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Config)>)> = vec![
            ("missing address", Box::new(|c| c.treasury.address.clear())),
            ("bad address", Box::new(|c| c.treasury.address = "kaspa:qqqq".into())),
            ("fee", Box::new(|c| c.treasury.fee = 101.0)),
            ("cache", Box::new(|c| c.stratum.cache_size = 0)),
            ("bounds", Box::new(|c| c.stratum.min_difficulty = 1e13)),
            ("initial", Box::new(|c| c.stratum.difficulty = 0.5)),
            ("spm", Box::new(|c| c.stratum.shares_per_minute = 0.0)),
            ("regex", Box::new(|c| c.stratum.asic_patterns = vec!["(".into()])),
            ("window", Box::new(|c| c.pool.window_secs = 0)),
        ];
        for (name, mutate) in cases {
            let mut config = valid();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(Error::Config(_))),
                "{name} accepted"
            );
        }
    }

    #[test]
    fn test_engine_config() {
        let mut config = valid();
        config.stratum.difficulty = 16.0;
        config.stratum.extranonce_size = 2;
        let engine = config.engine().unwrap();
        assert_eq!(engine.shares.initial_difficulty, Difficulty::new(16.0));
        assert_eq!(engine.shares.window, Duration::from_secs(600));
        assert_eq!(engine.shares.max_pending_contributions, 1_000_000);
        assert!(engine.shares.vardiff.clamp_pow2);
        assert_eq!(engine.extranonce_size, 2);
        assert_eq!(engine.identities.encoding_for("GodMiner/2.0"), Encoding::Asic);
        assert_eq!(engine.identities.encoding_for("lolMiner"), Encoding::Generic);
    }
}
