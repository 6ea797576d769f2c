//! Stratum server.
//!
//! Miners speak newline-delimited JSON over TCP. A connection moves through
//! three states:
//!
//! ```text
//! Connected --mining.subscribe--> Subscribed --mining.authorize--> Authorized
//!     \__________________mining.authorize_________________________/
//! ```
//!
//! Subscribing registers the connection for job broadcasts and fixes its job
//! encoding. Authorizing binds a worker name to a payout address; a
//! connection may carry several workers. Shares are accepted from any
//! authorized worker.
//!
//! The [`server`] owns sockets, the [`engine`] owns protocol state, and the
//! two are joined by an [`EngineHandle`].

pub mod codec;
pub mod engine;
pub mod messages;
pub mod server;

pub use engine::{EngineConfig, EngineHandle, StratumEngine};
pub use server::StratumServer;

slotmap::new_key_type! {
    /// Identifies a live connection inside the engine.
    pub struct ConnectionId;
}
