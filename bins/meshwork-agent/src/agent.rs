//! The agent aggregate
//!
//! One `MeshAgent` owns every registry in the system — connection registry,
//! overlay manager, listener bindings — and drives the topology refresh
//! loop: read the directory, request tunnels, reconcile the overlay, wire
//! up service listeners. Everything it starts runs under its shutdown
//! token, so cancelling that token takes the whole mesh presence down.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use meshwork_ice::{listen_for_requests, ConnectionRegistry};
use meshwork_overlay::{
    loopback_alias, overlay_address, DirectoryPeer, EnsureOutcome, OverlayManager, OverlayNet,
    OverlaySettings, TcpOverlayNet, TUNNEL_PROXY_PORT,
};
use meshwork_proxy::{forward_to_mesh, serve_from_mesh, ListenerBindings};
use meshwork_signal::SignalClient;
use meshwork_tasks::ShutdownToken;

use crate::config::AgentConfig;
use crate::directory::{DeviceDirectory, DeviceStatus, PeerRecord};

/// Peer name this device initiates from.
fn initiator_name(authority: &str) -> String {
    format!("{authority}-client")
}

/// Peer name this device answers on.
fn responder_name(authority: &str) -> String {
    format!("{authority}-server")
}

pub struct MeshAgent {
    config: AgentConfig,
    signal: Arc<SignalClient>,
    registry: Arc<ConnectionRegistry>,
    overlay: Arc<OverlayManager>,
    bindings: Arc<ListenerBindings>,
    directory: Arc<dyn DeviceDirectory>,
    local_net: Arc<dyn OverlayNet>,
    overlay_net: Arc<dyn OverlayNet>,
    token: ShutdownToken,
}

impl MeshAgent {
    pub fn new(
        config: AgentConfig,
        seed: [u8; 32],
        directory: Arc<dyn DeviceDirectory>,
        token: ShutdownToken,
    ) -> Result<Self> {
        let signal = Arc::new(
            SignalClient::new(config.signal_url.clone())
                .context("signal relay URL")?
                .with_freshness(Duration::from_secs(config.freshness_secs)),
        );
        let registry = Arc::new(ConnectionRegistry::new(
            signal.clone(),
            config.stun_servers.clone(),
            token.child(),
        ));

        let mut settings = OverlaySettings::new(config.authority.clone(), seed);
        settings.listen_port = config.overlay.listen_port;
        settings.tun_name = config.overlay.tun_name.clone();
        settings.mtu = config.overlay.mtu;
        let overlay = OverlayManager::new(settings, token.child());

        Ok(Self {
            config,
            signal,
            registry,
            overlay,
            bindings: Arc::new(ListenerBindings::new()),
            directory,
            local_net: Arc::new(TcpOverlayNet),
            overlay_net: Arc::new(TcpOverlayNet),
            token,
        })
    }

    /// The overlay public key this device derives from its seed; the value
    /// the directory is expected to publish for it.
    pub fn overlay_public_key(&self) -> String {
        meshwork_overlay::keys::encode_key(&self.overlay.public_key())
    }

    /// Run until the shutdown token fires. Only overlay bring-up failure is
    /// fatal; everything else logs and waits for the next cycle.
    pub async fn run(&self) -> Result<()> {
        info!(authority = %self.config.authority, "meshwork agent starting");

        // Answer tunnel requests from the moment the agent exists, so an
        // initiator's first auth push always has a puller.
        let responder = listen_for_requests(
            self.registry.clone(),
            self.signal.clone(),
            self.token.child(),
            responder_name(&self.config.authority),
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                self.config.overlay.listen_port,
            ),
        );

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.refresh().await {
                self.token.cancel();
                let _ = responder.await;
                return Err(e);
            }
        }

        let _ = responder.await;
        info!("meshwork agent stopped");
        Ok(())
    }

    /// One topology cycle. Errors returned here are fatal; transient
    /// problems are logged and deferred to the next cycle.
    pub async fn refresh(&self) -> Result<()> {
        let records = match self.directory.snapshot().await {
            Ok(records) => records,
            Err(e) => {
                warn!("directory snapshot failed: {e:#}");
                return Ok(());
            }
        };

        self.check_published_key(&records);
        self.request_tunnels(&records).await;

        let peers: Vec<DirectoryPeer> = records
            .iter()
            .map(|r| DirectoryPeer {
                authority: r.authority.clone(),
                hostname: r.hostname.clone(),
                registered: r.status == DeviceStatus::Registered,
            })
            .collect();
        let resolve = |authority: &str| -> Option<[u8; 32]> {
            records
                .iter()
                .find(|r| r.authority == authority)
                .and_then(|r| r.overlay_key.as_deref())
                .and_then(meshwork_overlay::keys::decode_key)
        };

        let offline = match self.overlay.ensure(&peers, &resolve).await {
            Ok(EnsureOutcome::NotReady) => {
                debug!("overlay not ready; listeners deferred");
                return Ok(());
            }
            Ok(EnsureOutcome::Initialized { offline }) | Ok(EnsureOutcome::Updated { offline }) => {
                offline
            }
            Err(e) => {
                if self.overlay.is_initialized().await {
                    warn!("overlay reconfiguration failed: {e}");
                    return Ok(());
                }
                // The interface cannot be partially initialized.
                return Err(e).context("overlay bring-up failed");
            }
        };
        for authority in &offline {
            debug!(%authority, "peer off this cycle, key not yet published");
        }

        self.wire_listeners(&records, &offline);
        Ok(())
    }

    fn check_published_key(&self, records: &[PeerRecord]) {
        let published = records
            .iter()
            .find(|r| r.authority == self.config.authority)
            .and_then(|r| r.overlay_key.as_deref());
        if let Some(published) = published {
            if published != self.overlay_public_key() {
                warn!("directory overlay key does not match the local seed");
            }
        }
    }

    /// Ask for a tunnel to every registered remote device. Deduplication is
    /// the registry's job; retry of failed attempts happens here simply by
    /// asking again next cycle.
    async fn request_tunnels(&self, records: &[PeerRecord]) {
        for (index, record) in records.iter().enumerate() {
            if record.status != DeviceStatus::Registered
                || record.authority == self.config.authority
            {
                continue;
            }
            let proxy_addr = SocketAddr::new(
                IpAddr::V4(loopback_alias(index)),
                TUNNEL_PROXY_PORT,
            );
            self.registry
                .request_connection(
                    &initiator_name(&self.config.authority),
                    &responder_name(&record.authority),
                    proxy_addr,
                )
                .await;
        }
    }

    /// Start (idempotently) the service relay loops: remote services appear
    /// on per-peer loopback aliases, local services are served to the mesh.
    fn wire_listeners(&self, records: &[PeerRecord], offline: &[String]) {
        for (index, record) in records.iter().enumerate() {
            if record.status != DeviceStatus::Registered {
                continue;
            }

            if record.authority == self.config.authority {
                for service in &record.services {
                    let token = self.token.child();
                    let bindings = self.bindings.clone();
                    let overlay_net = self.overlay_net.clone();
                    let local_net = self.local_net.clone();
                    let name = service.name.clone();
                    let mesh_listen =
                        SocketAddr::new(IpAddr::V4(overlay_address(index)), service.port);
                    let local_addr = SocketAddr::new(
                        IpAddr::V4(Ipv4Addr::LOCALHOST),
                        service.port,
                    );
                    tokio::spawn(async move {
                        if let Err(e) = serve_from_mesh(
                            token,
                            bindings,
                            &name,
                            overlay_net,
                            mesh_listen,
                            local_net,
                            local_addr,
                        )
                        .await
                        {
                            warn!(service = %name, "mesh listener ended: {e}");
                        }
                    });
                }
                continue;
            }

            if offline.contains(&record.authority) {
                continue;
            }
            for service in &record.services {
                let token = self.token.child();
                let bindings = self.bindings.clone();
                let local_net = self.local_net.clone();
                let overlay_net = self.overlay_net.clone();
                let name = service.name.clone();
                let listen =
                    SocketAddr::new(IpAddr::V4(loopback_alias(index)), service.port);
                let mesh_addr =
                    SocketAddr::new(IpAddr::V4(overlay_address(index)), service.port);
                tokio::spawn(async move {
                    if let Err(e) = forward_to_mesh(
                        token,
                        bindings,
                        &name,
                        local_net,
                        listen,
                        overlay_net,
                        mesh_addr,
                    )
                    .await
                    {
                        warn!(service = %name, "local listener ended: {e}");
                    }
                });
            }
        }
    }

    /// Connection states for status output.
    pub async fn connection_states(&self) -> std::collections::BTreeMap<String, String> {
        self.registry
            .connection_states()
            .await
            .into_iter()
            .map(|(key, state)| (key, state.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ServiceSpec;
    use async_trait::async_trait;

    struct StaticDirectory(Vec<PeerRecord>);

    #[async_trait]
    impl DeviceDirectory for StaticDirectory {
        async fn snapshot(&self) -> Result<Vec<PeerRecord>> {
            Ok(self.0.clone())
        }
    }

    fn record(authority: &str, status: DeviceStatus) -> PeerRecord {
        PeerRecord {
            authority: authority.into(),
            hostname: format!("host-{authority}"),
            status,
            overlay_key: None,
            services: vec![ServiceSpec {
                name: "web".into(),
                protocol: "tcp".into(),
                port: 8080,
            }],
        }
    }

    fn test_agent(records: Vec<PeerRecord>) -> MeshAgent {
        let mut config = AgentConfig::default();
        config.authority = "local-dev".to_string();
        // A relay nobody answers; sessions just stay pending.
        config.signal_url = "http://127.0.0.1:9".to_string();
        MeshAgent::new(
            config,
            [7u8; 32],
            Arc::new(StaticDirectory(records)),
            ShutdownToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_refresh_requests_tunnels_to_remote_peers_only() {
        let agent = test_agent(vec![
            record("local-dev", DeviceStatus::Registered),
            record("remote-1", DeviceStatus::Registered),
            record("remote-2", DeviceStatus::Deleted),
            record("remote-3", DeviceStatus::Registered),
        ]);

        agent.refresh().await.unwrap();

        let states = agent.connection_states().await;
        assert_eq!(states.len(), 2);
        assert!(states.contains_key("local-dev-client_remote-1-server"));
        assert!(states.contains_key("local-dev-client_remote-3-server"));
        agent.token.cancel();
    }

    #[tokio::test]
    async fn test_refresh_without_local_key_is_not_fatal() {
        // No overlay keys published at all: overlay stays NotReady, refresh
        // still succeeds and will retry next cycle.
        let agent = test_agent(vec![
            record("local-dev", DeviceStatus::Registered),
            record("remote-1", DeviceStatus::Registered),
        ]);

        agent.refresh().await.unwrap();
        assert!(!agent.overlay.is_initialized().await);
        agent.token.cancel();
    }

    #[tokio::test]
    async fn test_directory_failure_is_transient() {
        struct BrokenDirectory;
        #[async_trait]
        impl DeviceDirectory for BrokenDirectory {
            async fn snapshot(&self) -> Result<Vec<PeerRecord>> {
                anyhow::bail!("ledger unreachable")
            }
        }

        let mut config = AgentConfig::default();
        config.authority = "local-dev".to_string();
        config.signal_url = "http://127.0.0.1:9".to_string();
        let agent = MeshAgent::new(
            config,
            [7u8; 32],
            Arc::new(BrokenDirectory),
            ShutdownToken::new(),
        )
        .unwrap();

        assert!(agent.refresh().await.is_ok());
        agent.token.cancel();
    }
}
