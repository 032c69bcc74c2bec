//! TUN device abstraction
//!
//! The overlay interface binds a local virtual address on a platform TUN
//! device; the OS then routes the overlay subnet through it. Only Linux is
//! wired up; other platforms report `PlatformNotSupported`.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::OverlayResult;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

/// TUN device configuration
#[derive(Clone, Debug)]
pub struct TunConfig {
    /// Device name (e.g., "mesh0")
    pub name: String,

    /// Local overlay address
    pub address: Ipv4Addr,

    /// Subnet mask of the overlay network
    pub netmask: Ipv4Addr,

    /// Maximum transmission unit
    pub mtu: u16,

    /// DNS fallback servers advertised for the interface
    pub dns_servers: Vec<Ipv4Addr>,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: "mesh0".to_string(),
            address: Ipv4Addr::new(192, 169, 99, 2),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: crate::config::OVERLAY_MTU,
            dns_servers: crate::config::DNS_FALLBACKS.to_vec(),
        }
    }
}

/// Platform-agnostic TUN device trait
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one IP packet from the device
    async fn read(&self) -> OverlayResult<Bytes>;

    /// Write one IP packet to the device
    async fn write(&self, packet: &[u8]) -> OverlayResult<()>;

    /// Device name
    fn name(&self) -> &str;

    /// Device MTU
    fn mtu(&self) -> u16;

    /// Close the device
    async fn close(&self) -> OverlayResult<()>;
}

/// Create a TUN device for the current platform.
pub async fn create_tun(config: TunConfig) -> OverlayResult<Box<dyn TunDevice>> {
    #[cfg(target_os = "linux")]
    {
        let tun = LinuxTun::create(config).await?;
        Ok(Box::new(tun))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Err(crate::error::OverlayError::PlatformNotSupported)
    }
}

/// IP packet parser utilities
pub mod ip {
    use std::net::Ipv4Addr;

    /// Destination address of an IPv4 packet.
    pub fn ipv4_dst(packet: &[u8]) -> Option<Ipv4Addr> {
        if packet.len() < 20 || packet[0] >> 4 != 4 {
            return None;
        }
        Some(Ipv4Addr::new(
            packet[16], packet[17], packet[18], packet[19],
        ))
    }

    /// Source address of an IPv4 packet.
    pub fn ipv4_src(packet: &[u8]) -> Option<Ipv4Addr> {
        if packet.len() < 20 || packet[0] >> 4 != 4 {
            return None;
        }
        Some(Ipv4Addr::new(
            packet[12], packet[13], packet[14], packet[15],
        ))
    }

}

#[cfg(test)]
pub(crate) mod mem {
    //! In-memory TUN double for device tests.

    use super::*;
    use tokio::sync::{mpsc, Mutex};

    pub struct MemTun {
        name: String,
        mtu: u16,
        inbound_rx: Mutex<mpsc::Receiver<Bytes>>,
        outbound_tx: mpsc::Sender<Bytes>,
    }

    /// Test-side handles: inject packets "from the OS", observe packets
    /// written back to it.
    pub struct MemTunHandle {
        pub inject: mpsc::Sender<Bytes>,
        pub outbound: mpsc::Receiver<Bytes>,
    }

    impl MemTun {
        pub fn new(name: &str) -> (Self, MemTunHandle) {
            let (inject, inbound_rx) = mpsc::channel(64);
            let (outbound_tx, outbound) = mpsc::channel(64);
            (
                Self {
                    name: name.to_string(),
                    mtu: crate::config::OVERLAY_MTU,
                    inbound_rx: Mutex::new(inbound_rx),
                    outbound_tx,
                },
                MemTunHandle { inject, outbound },
            )
        }
    }

    #[async_trait]
    impl TunDevice for MemTun {
        async fn read(&self) -> OverlayResult<Bytes> {
            self.inbound_rx
                .lock()
                .await
                .recv()
                .await
                .ok_or(crate::error::OverlayError::Tun("mem tun closed".into()))
        }

        async fn write(&self, packet: &[u8]) -> OverlayResult<()> {
            self.outbound_tx
                .send(Bytes::copy_from_slice(packet))
                .await
                .map_err(|_| crate::error::OverlayError::Tun("mem tun closed".into()))
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn mtu(&self) -> u16 {
            self.mtu
        }

        async fn close(&self) -> OverlayResult<()> {
            Ok(())
        }
    }
}
