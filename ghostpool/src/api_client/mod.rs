//! API client library.
//!
//! A thin `reqwest` client for the pool's HTTP API, used by the CLI and by
//! anything that posts coinbase notifications on the treasury's behalf.

use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pool::Balance;
use crate::shares::PoolStats;
use crate::treasury::{CoinbaseNotice, RewardEvent};

const TIMEOUT: Duration = Duration::from_secs(10);

pub struct Client {
    http: reqwest::Client,
    base: Url,
}

impl Client {
    /// Create a client for the API at `base`, e.g. `http://127.0.0.1:9100`.
    pub fn new(base: &str) -> Result<Self> {
        let base = Url::parse(base).map_err(|e| Error::Config(format!("API URL '{base}': {e}")))?;
        let http = reqwest::Client::builder().timeout(TIMEOUT).build()?;
        Ok(Self { http, base })
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        self.get("stats").await
    }

    pub async fn balances(&self) -> Result<Vec<Balance>> {
        self.get("balances").await
    }

    pub async fn config(&self) -> Result<Config> {
        self.get("config").await
    }

    /// Report a matured coinbase. Returns the event queued for allocation.
    pub async fn post_coinbase(&self, notice: &CoinbaseNotice) -> Result<RewardEvent> {
        let response = self
            .http
            .post(self.url("treasury/coinbase")?)
            .json(notice)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path)?)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(&format!("/api/v1/{path}"))
            .map_err(|e| Error::Config(format!("API path '{path}': {e}")))
    }
}
