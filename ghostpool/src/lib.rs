//! ghostpool: a Kaspa Stratum mining pool.

pub mod address;
pub mod api;
pub mod api_client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod node;
pub mod pool;
pub mod shares;
pub mod stratum;
pub mod template;
pub mod tracing;
pub mod treasury;
pub mod types;
pub mod u256;
