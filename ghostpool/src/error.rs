//! Common error types for ghostpool.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.
//! Protocol-level rejections that are answered on the wire (share outcomes,
//! Stratum error codes) have their own types next to the code that produces
//! them; this enum covers failures that propagate.

use thiserror::Error;

use crate::address::AddressError;

/// Main error type for ghostpool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Node RPC errors (template fetch, block submission, lookups)
    #[error("Node error: {0}")]
    Node(String),

    /// Balance store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Wallet address errors
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// JSON encoding or decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The engine task has stopped and no longer accepts commands
    #[error("engine is not running")]
    EngineStopped,
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
