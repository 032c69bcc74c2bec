//! Overlay manager
//!
//! Owns the single overlay device instance. The first usable configuration
//! brings the interface up; every bring-up failure is fatal because a
//! half-initialized interface cannot be recovered without a restart. Later
//! topology changes re-apply the regenerated full peer list, which the
//! device reconciles idempotently. "No usable configuration yet" is a
//! silent no-op, never an error.

use std::net::Ipv4Addr;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info};

use meshwork_tasks::ShutdownToken;

use crate::config::{DirectoryPeer, OverlayConfigBuilder, OVERLAY_LISTEN_PORT};
use crate::device::WireguardDevice;
use crate::error::OverlayResult;
use crate::keys;
use crate::tun::{create_tun, TunConfig, TunDevice};

/// Everything the manager needs to bring the overlay up.
#[derive(Debug, Clone)]
pub struct OverlaySettings {
    /// Public identity of the local device in the directory.
    pub local_authority: String,
    /// Key-custody seed the overlay keypair is derived from.
    pub seed: [u8; 32],
    /// UDP listen port for the overlay device.
    pub listen_port: u16,
    /// TUN interface name.
    pub tun_name: String,
    /// Interface MTU.
    pub mtu: u16,
    /// DNS fallbacks for the interface.
    pub dns_servers: Vec<Ipv4Addr>,
}

impl OverlaySettings {
    pub fn new(local_authority: impl Into<String>, seed: [u8; 32]) -> Self {
        Self {
            local_authority: local_authority.into(),
            seed,
            listen_port: OVERLAY_LISTEN_PORT,
            tun_name: "mesh0".to_string(),
            mtu: crate::config::OVERLAY_MTU,
            dns_servers: crate::config::DNS_FALLBACKS.to_vec(),
        }
    }
}

/// What a reconfiguration pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Configuration could not be generated yet; nothing changed.
    NotReady,
    /// First-time bring-up completed.
    Initialized { offline: Vec<String> },
    /// Existing device reconfigured.
    Updated { offline: Vec<String> },
}

/// Creates the TUN device; injectable so tests run without an interface.
pub type TunFactory =
    Arc<dyn Fn(TunConfig) -> BoxFuture<'static, OverlayResult<Box<dyn TunDevice>>> + Send + Sync>;

struct Active {
    device: Arc<WireguardDevice>,
    local_address: Ipv4Addr,
}

/// Owner of the overlay device and its configuration lifecycle.
pub struct OverlayManager {
    settings: OverlaySettings,
    builder: OverlayConfigBuilder,
    public_key: [u8; 32],
    tun_factory: TunFactory,
    active: Mutex<Option<Active>>,
    token: ShutdownToken,
}

impl OverlayManager {
    /// Create a manager backed by the platform TUN device.
    pub fn new(settings: OverlaySettings, token: ShutdownToken) -> Arc<Self> {
        Self::with_tun_factory(
            settings,
            token,
            Arc::new(|config| Box::pin(create_tun(config))),
        )
    }

    /// Create a manager with an injected TUN factory.
    pub fn with_tun_factory(
        settings: OverlaySettings,
        token: ShutdownToken,
        tun_factory: TunFactory,
    ) -> Arc<Self> {
        let (private_key, public_key) = keys::derive_keypair(&settings.seed);
        let builder = OverlayConfigBuilder::new(
            settings.local_authority.clone(),
            private_key,
            settings.listen_port,
        );
        let manager = Arc::new(Self {
            settings,
            builder,
            public_key,
            tun_factory,
            active: Mutex::new(None),
            token: token.clone(),
        });

        // Shutdown-context cancellation tears the interface down so a later
        // re-initialization starts clean.
        let watcher = manager.clone();
        tokio::spawn(async move {
            watcher.token.cancelled().await;
            watcher.shutdown().await;
        });

        manager
    }

    /// The local overlay public key, as published to the directory.
    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    /// Its display (base64) form.
    pub fn public_key_display(&self) -> String {
        keys::display_key(&self.public_key)
    }

    /// Bring the overlay in line with a directory snapshot.
    ///
    /// Serializes against concurrent calls, so a reconfiguration can never
    /// race first-time initialization.
    pub async fn ensure(
        &self,
        peers: &[DirectoryPeer],
        resolve: &(dyn Fn(&str) -> Option<[u8; 32]> + Sync),
    ) -> OverlayResult<EnsureOutcome> {
        let mut active = self.active.lock().await;

        let Some(config) = self.builder.build(peers, resolve) else {
            debug!("overlay configuration not ready");
            return Ok(EnsureOutcome::NotReady);
        };

        match active.as_ref() {
            None => {
                info!(address = %config.local_address, "initializing overlay network");
                let tun = (self.tun_factory)(TunConfig {
                    name: self.settings.tun_name.clone(),
                    address: config.local_address,
                    netmask: Ipv4Addr::new(255, 255, 255, 0),
                    mtu: self.settings.mtu,
                    dns_servers: self.settings.dns_servers.clone(),
                })
                .await?;

                let device = WireguardDevice::create(
                    tun,
                    self.settings.listen_port,
                    config.private_key,
                    self.token.child(),
                )
                .await?;
                device.apply_config(&config.to_uapi()).await?;
                device.up();

                *active = Some(Active {
                    device: Arc::new(device),
                    local_address: config.local_address,
                });
                info!(address = %config.local_address, "overlay network up");
                Ok(EnsureOutcome::Initialized {
                    offline: config.offline,
                })
            }
            Some(current) => {
                current.device.apply_config(&config.to_uapi()).await?;
                Ok(EnsureOutcome::Updated {
                    offline: config.offline,
                })
            }
        }
    }

    /// Local overlay address, once initialized.
    pub async fn local_address(&self) -> Option<Ipv4Addr> {
        self.active.lock().await.as_ref().map(|a| a.local_address)
    }

    /// Whether the device has been brought up.
    pub async fn is_initialized(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Close the device and clear state; a later `ensure` starts over.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        if let Some(current) = active.take() {
            current.device.close().await;
            info!("overlay network shut down");
        } else {
            debug!("overlay shutdown with no active device");
        }
    }
}
