//! Byte forwarding between local services and the meshwork overlay
//!
//! The forwarding engine ([`forward`], [`forward_bounded`]) relays one pair
//! of duplex connections; the relay loops ([`forward_to_mesh`],
//! [`serve_from_mesh`]) accept connections and spawn one bounded session
//! each, under an idempotent [`ListenerBindings`] registry.

pub mod error;
pub mod forward;
pub mod listener;

pub use error::{ProxyError, ProxyResult};
pub use forward::{forward, forward_bounded, FORWARD_TIMEOUT};
pub use listener::{
    forward_to_mesh, listen_and_relay, serve_from_mesh, ListenerBindings, TargetResolver,
};
