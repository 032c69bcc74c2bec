//! Signaling channel for meshwork
//!
//! Before two peers have a direct tunnel they exchange small handshake
//! messages through a third-party relay that both can reach. This crate
//! provides:
//! - the message and channel types ([`SignalMessage`], [`Channel`])
//! - the relay client ([`SignalClient`]) with push/pull semantics
//! - the relay router itself ([`relay::router`]), shared by the
//!   `meshwork-signal-server` binary and the tests
//!
//! The relay retains at most one pending message per channel id; a second
//! push overwrites it. Pullers block (bounded by the relay's own timeout)
//! until a message appears, and messages older than the freshness window
//! are discarded on the client side.

pub mod client;
pub mod error;
pub mod message;
pub mod relay;

pub use client::SignalClient;
pub use error::{SignalError, SignalResult};
pub use message::{Channel, SignalMessage};
