//! Encrypted overlay network for meshwork
//!
//! Gives every device in a workgroup a stable virtual address on top of the
//! negotiated tunnels:
//! - configuration generation from directory snapshots ([`config`])
//! - the userspace WireGuard device itself ([`device`])
//! - the TUN abstraction it sits on ([`tun`])
//! - the dial/listen seam used by the forwarding engine ([`net`])
//! - the manager owning the device lifecycle ([`manager`])

pub mod config;
pub mod device;
pub mod error;
pub mod keys;
pub mod manager;
pub mod net;
pub mod tun;

pub use config::{
    loopback_alias, overlay_address, DirectoryPeer, OverlayConfig, OverlayConfigBuilder,
    OverlayPeer, KEEPALIVE_SECS, OVERLAY_LISTEN_PORT, OVERLAY_MTU, TUNNEL_PROXY_PORT,
};
pub use device::{PeerStatus, WireguardDevice};
pub use error::{OverlayError, OverlayResult};
pub use manager::{EnsureOutcome, OverlayManager, OverlaySettings};
pub use net::{MemNet, OverlayListener, OverlayNet, OverlayStream, TcpOverlayNet};
pub use tun::{create_tun, TunConfig, TunDevice};
