//! Command-line interface for ghostpool.
//!
//! Queries a running pool through its HTTP API.
//!
//! ```text
//! ghostpool-cli [--api URL] stats|balances|config
//! ```
//!
//! The API URL defaults to `GHOSTPOOL_API`, then `http://127.0.0.1:9100`.

use std::env;

use anyhow::{bail, Context, Result};

use ghostpool::api_client::Client;
use ghostpool::shares::report::render_table;

const API_ENV: &str = "GHOSTPOOL_API";
const DEFAULT_API: &str = "http://127.0.0.1:9100";
const USAGE: &str = "usage: ghostpool-cli [--api URL] stats|balances|config";

#[tokio::main]
async fn main() -> Result<()> {
    let mut api = env::var(API_ENV).unwrap_or_else(|_| DEFAULT_API.to_string());
    let mut command = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--api" => api = args.next().context(USAGE)?,
            "-h" | "--help" => {
                println!("{USAGE}");
                return Ok(());
            }
            _ if command.is_none() => command = Some(arg),
            _ => bail!(USAGE),
        }
    }

    let client = Client::new(&api)?;
    match command.as_deref() {
        Some("stats") => {
            let stats = client.stats().await?;
            println!("{}", render_table(&stats));
            println!(
                "miners: {}  connections: {}  templates: {}  pending contributions: {}  dropped: {}",
                stats.miners,
                stats.connections,
                stats.live_templates,
                stats.pending_contributions,
                stats.dropped_contributions
            );
        }
        Some("balances") => {
            let balances = client.balances().await?;
            if balances.is_empty() {
                println!("no balances");
            }
            for b in balances {
                println!("{:<70} {:<16} {:>20}", b.address, b.miner_id, b.balance);
            }
        }
        Some("config") => {
            let config = client.config().await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        _ => bail!(USAGE),
    }
    Ok(())
}
