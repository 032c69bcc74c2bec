//! Linux TUN device implementation

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

use super::{TunConfig, TunDevice};
use crate::error::{OverlayError, OverlayResult};

/// Linux TUN device
pub struct LinuxTun {
    device: tokio::sync::Mutex<tun::AsyncDevice>,
    name: String,
    mtu: u16,
}

impl LinuxTun {
    /// Create a new Linux TUN device
    pub async fn create(config: TunConfig) -> OverlayResult<Self> {
        let mut tun_config = tun::Configuration::default();

        tun_config
            .name(&config.name)
            .address(config.address)
            .netmask(config.netmask)
            .mtu(config.mtu as i32)
            .up();

        tun_config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| OverlayError::Tun(format!("failed to create TUN device: {e}")))?;

        info!(
            "created TUN device {} with address {}/{} (dns fallbacks: {:?})",
            config.name, config.address, config.netmask, config.dns_servers
        );

        Ok(Self {
            device: tokio::sync::Mutex::new(device),
            name: config.name,
            mtu: config.mtu,
        })
    }
}

#[async_trait]
impl TunDevice for LinuxTun {
    async fn read(&self) -> OverlayResult<Bytes> {
        let mut buf = vec![0u8; self.mtu as usize + 4];
        let mut device = self.device.lock().await;
        let n = device
            .read(&mut buf)
            .await
            .map_err(|e| OverlayError::Tun(format!("read failed: {e}")))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write(&self, packet: &[u8]) -> OverlayResult<()> {
        let mut device = self.device.lock().await;
        device
            .write_all(packet)
            .await
            .map_err(|e| OverlayError::Tun(format!("write failed: {e}")))?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn close(&self) -> OverlayResult<()> {
        // Dropping the fd tears the interface down; nothing explicit needed.
        Ok(())
    }
}
