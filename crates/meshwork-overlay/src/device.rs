//! Userspace WireGuard device
//!
//! Pumps packets between the TUN interface and the UDP socket, one noise
//! tunnel per peer. Outbound packets are routed to a peer by the allowed-ip
//! table; inbound datagrams are matched by source endpoint, falling back to
//! trying each peer's tunnel — linear, but workgroup meshes are small and a
//! miss only happens when a peer roams.
//!
//! Configuration arrives as the textual key=value protocol and is applied
//! idempotently: re-applying the same full peer list is a no-op, new peers
//! are added, absent peers are torn down, moved endpoints are updated.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use meshwork_tasks::ShutdownToken;

use crate::config::{parse_uapi, UapiPeer};
use crate::error::{OverlayError, OverlayResult};
use crate::tun::{ip, TunDevice};

const PACKET_BUF: usize = 65536;

/// Timer cadence recommended for boringtun tunnels.
const TIMER_TICK: std::time::Duration = std::time::Duration::from_millis(250);

struct Peer {
    public_key: [u8; 32],
    tunn: tokio::sync::Mutex<Tunn>,
    endpoint: std::sync::Mutex<SocketAddr>,
    allowed_ip: Ipv4Addr,
}

impl Peer {
    fn endpoint(&self) -> SocketAddr {
        *self.endpoint.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_endpoint(&self, endpoint: SocketAddr) {
        *self.endpoint.lock().unwrap_or_else(|e| e.into_inner()) = endpoint;
    }
}

#[derive(Default)]
struct PeerMap {
    by_key: HashMap<[u8; 32], Arc<Peer>>,
    by_ip: HashMap<Ipv4Addr, [u8; 32]>,
    by_endpoint: HashMap<SocketAddr, [u8; 32]>,
}

impl PeerMap {
    fn peer_by_ip(&self, ip: &Ipv4Addr) -> Option<Arc<Peer>> {
        self.by_ip.get(ip).and_then(|k| self.by_key.get(k)).cloned()
    }

    fn peer_by_endpoint(&self, endpoint: &SocketAddr) -> Option<Arc<Peer>> {
        self.by_endpoint
            .get(endpoint)
            .and_then(|k| self.by_key.get(k))
            .cloned()
    }

    fn all(&self) -> Vec<Arc<Peer>> {
        self.by_key.values().cloned().collect()
    }

    fn rebuild_indexes(&mut self) {
        self.by_ip = self
            .by_key
            .values()
            .map(|p| (p.allowed_ip, p.public_key))
            .collect();
        self.by_endpoint = self
            .by_key
            .values()
            .map(|p| (p.endpoint(), p.public_key))
            .collect();
    }
}

/// Status of one configured peer, for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub public_key: [u8; 32],
    pub endpoint: SocketAddr,
    pub allowed_ip: Ipv4Addr,
}

/// The overlay device: one TUN interface, one UDP socket, many peers.
pub struct WireguardDevice {
    tun: Arc<dyn TunDevice>,
    socket: Arc<UdpSocket>,
    private_key: [u8; 32],
    listen_port: u16,
    peers: Arc<RwLock<PeerMap>>,
    next_index: AtomicU32,
    token: ShutdownToken,
}

impl WireguardDevice {
    /// Bind the UDP side and take ownership of an already-created TUN
    /// device. `listen_port` 0 binds an ephemeral port.
    pub async fn create(
        tun: Box<dyn TunDevice>,
        listen_port: u16,
        private_key: [u8; 32],
        token: ShutdownToken,
    ) -> OverlayResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", listen_port)).await?;
        let listen_port = socket.local_addr()?.port();
        info!(device = tun.name(), listen_port, "overlay device created");

        Ok(Self {
            tun: Arc::from(tun),
            socket: Arc::new(socket),
            private_key,
            listen_port,
            peers: Arc::new(RwLock::new(PeerMap::default())),
            next_index: AtomicU32::new(0),
            token,
        })
    }

    /// The UDP port the device actually listens on.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Apply a full configuration in the textual key=value protocol,
    /// reconciling the peer set against it.
    pub async fn apply_config(&self, text: &str) -> OverlayResult<()> {
        let parsed = parse_uapi(text)?;
        if parsed.private_key != self.private_key {
            return Err(OverlayError::Config(
                "private key change requires re-initialization".into(),
            ));
        }

        let mut peers = self.peers.write().await;
        let incoming: HashSet<[u8; 32]> = parsed.peers.iter().map(|p| p.public_key).collect();

        let before = peers.by_key.len();
        peers.by_key.retain(|key, _| incoming.contains(key));
        let removed = before - peers.by_key.len();

        let mut added = 0;
        for spec in parsed.peers {
            let updated_in_place = match peers.by_key.get(&spec.public_key) {
                Some(existing) if existing.allowed_ip == spec.allowed_ip => {
                    if existing.endpoint() != spec.endpoint {
                        debug!(endpoint = %spec.endpoint, "peer endpoint updated");
                        existing.set_endpoint(spec.endpoint);
                    }
                    true
                }
                _ => false,
            };
            if !updated_in_place {
                let peer = self.build_peer(&spec);
                peers.by_key.insert(spec.public_key, Arc::new(peer));
                added += 1;
            }
        }
        peers.rebuild_indexes();

        info!(
            peers = peers.by_key.len(),
            added, removed, "overlay configuration applied"
        );
        Ok(())
    }

    fn build_peer(&self, spec: &UapiPeer) -> Peer {
        let tunn = Tunn::new(
            StaticSecret::from(self.private_key),
            PublicKey::from(spec.public_key),
            None, // preshared key
            spec.keepalive,
            self.next_index.fetch_add(1, Ordering::SeqCst),
            None, // rate limiter
        )
        .expect("valid Tunn parameters");
        Peer {
            public_key: spec.public_key,
            tunn: tokio::sync::Mutex::new(tunn),
            endpoint: std::sync::Mutex::new(spec.endpoint),
            allowed_ip: spec.allowed_ip,
        }
    }

    /// Start the packet pumps. Idempotent callers should invoke this once;
    /// the pumps stop when the device token is cancelled.
    pub fn up(&self) {
        self.spawn_tun_pump();
        self.spawn_net_pump();
        self.spawn_timer_pump();
        info!("overlay device up");
    }

    /// Stop the pumps and close the interface.
    pub async fn close(&self) {
        self.token.cancel();
        if let Err(e) = self.tun.close().await {
            warn!("TUN close failed: {e}");
        }
        info!("overlay device closed");
    }

    /// Snapshot of configured peers.
    pub async fn peer_status(&self) -> Vec<PeerStatus> {
        self.peers
            .read()
            .await
            .all()
            .into_iter()
            .map(|p| PeerStatus {
                public_key: p.public_key,
                endpoint: p.endpoint(),
                allowed_ip: p.allowed_ip,
            })
            .collect()
    }

    // Outbound: TUN -> encrypt -> UDP.
    fn spawn_tun_pump(&self) {
        let tun = self.tun.clone();
        let socket = self.socket.clone();
        let peers = self.peers.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            let mut dst = vec![0u8; PACKET_BUF];
            loop {
                let packet = tokio::select! {
                    _ = token.cancelled() => break,
                    p = tun.read() => p,
                };
                let packet = match packet {
                    Ok(p) => p,
                    Err(e) => {
                        if token.is_cancelled() {
                            break;
                        }
                        warn!("TUN read error: {e}");
                        continue;
                    }
                };
                let Some(dst_ip) = ip::ipv4_dst(&packet) else {
                    continue;
                };
                let Some(peer) = peers.read().await.peer_by_ip(&dst_ip) else {
                    trace!(%dst_ip, "no peer route for packet");
                    continue;
                };

                let mut tunn = peer.tunn.lock().await;
                match tunn.encapsulate(&packet, &mut dst) {
                    TunnResult::WriteToNetwork(data) => {
                        if let Err(e) = socket.send_to(data, peer.endpoint()).await {
                            debug!("send to {} failed: {e}", peer.endpoint());
                        }
                    }
                    TunnResult::Err(e) => warn!("encapsulation error: {:?}", e),
                    _ => {}
                }
            }
        });
    }

    // Inbound: UDP -> decrypt -> TUN.
    fn spawn_net_pump(&self) {
        let tun = self.tun.clone();
        let socket = self.socket.clone();
        let peers = self.peers.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; PACKET_BUF];
            let mut dst = vec![0u8; PACKET_BUF];
            loop {
                let received = tokio::select! {
                    _ = token.cancelled() => break,
                    r = socket.recv_from(&mut buf) => r,
                };
                let (n, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        if token.is_cancelled() {
                            break;
                        }
                        warn!("overlay socket read error: {e}");
                        continue;
                    }
                };

                let known = peers.read().await.peer_by_endpoint(&from);
                match known {
                    Some(peer) => {
                        if !process_incoming(&peer, &socket, &tun, &buf[..n], &mut dst, from).await
                        {
                            debug!(%from, "datagram from known endpoint did not decrypt");
                        }
                    }
                    None => {
                        // Roamed or not-yet-seen peer: try each tunnel.
                        let candidates = peers.read().await.all();
                        let mut matched = None;
                        for peer in candidates {
                            if process_incoming(&peer, &socket, &tun, &buf[..n], &mut dst, from)
                                .await
                            {
                                matched = Some(peer);
                                break;
                            }
                        }
                        match matched {
                            Some(peer) => {
                                peer.set_endpoint(from);
                                let mut map = peers.write().await;
                                map.by_endpoint.retain(|_, k| *k != peer.public_key);
                                map.by_endpoint.insert(from, peer.public_key);
                                debug!(%from, "peer endpoint learned");
                            }
                            None => trace!(%from, "datagram from unknown source dropped"),
                        }
                    }
                }
            }
        });
    }

    // Handshake retries and keepalives.
    fn spawn_timer_pump(&self) {
        let socket = self.socket.clone();
        let peers = self.peers.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TIMER_TICK);
            let mut dst = vec![0u8; 1500];
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                for peer in peers.read().await.all() {
                    let mut tunn = peer.tunn.lock().await;
                    match tunn.update_timers(&mut dst) {
                        TunnResult::WriteToNetwork(data) => {
                            if let Err(e) = socket.send_to(data, peer.endpoint()).await {
                                debug!("timer send failed: {e}");
                            }
                        }
                        TunnResult::Err(e) => debug!("timer update error: {:?}", e),
                        _ => {}
                    }
                }
            }
        });
    }
}

/// Run one datagram through a peer's tunnel. Returns false when the packet
/// does not belong to this peer.
async fn process_incoming(
    peer: &Arc<Peer>,
    socket: &Arc<UdpSocket>,
    tun: &Arc<dyn TunDevice>,
    datagram: &[u8],
    dst: &mut [u8],
    from: SocketAddr,
) -> bool {
    let mut tunn = peer.tunn.lock().await;
    let mut result = tunn.decapsulate(Some(from.ip()), datagram, dst);

    loop {
        match result {
            TunnResult::WriteToNetwork(data) => {
                // Handshake response or queued packets; flush the queue.
                if let Err(e) = socket.send_to(data, from).await {
                    debug!("send to {from} failed: {e}");
                }
                result = tunn.decapsulate(None, &[], dst);
            }
            TunnResult::WriteToTunnelV4(data, _) | TunnResult::WriteToTunnelV6(data, _) => {
                if let Err(e) = tun.write(data).await {
                    warn!("TUN write error: {e}");
                }
                return true;
            }
            TunnResult::Done => return true,
            TunnResult::Err(e) => {
                trace!("decapsulation rejected: {:?}", e);
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OverlayConfig, OverlayPeer, KEEPALIVE_SECS};
    use crate::keys;
    use crate::tun::mem::MemTun;
    use bytes::Bytes;
    use std::time::Duration;

    fn config_text(
        private_key: [u8; 32],
        listen_port: u16,
        peers: &[([u8; 32], SocketAddr, Ipv4Addr)],
    ) -> String {
        OverlayConfig {
            local_address: Ipv4Addr::new(192, 169, 99, 2),
            listen_port,
            private_key,
            peers: peers
                .iter()
                .map(|(key, endpoint, ip)| OverlayPeer {
                    authority: String::new(),
                    public_key: *key,
                    endpoint: *endpoint,
                    allowed_ip: *ip,
                    keepalive: KEEPALIVE_SECS,
                })
                .collect(),
            offline: vec![],
        }
        .to_uapi()
    }

    #[tokio::test]
    async fn test_apply_config_reconciles_peers() {
        let (private, _) = keys::derive_keypair(&[1u8; 32]);
        let (_, peer_a) = keys::derive_keypair(&[2u8; 32]);
        let (_, peer_b) = keys::derive_keypair(&[3u8; 32]);

        let (tun, _handle) = MemTun::new("mesh-test");
        let device = WireguardDevice::create(Box::new(tun), 0, private, ShutdownToken::new())
            .await
            .unwrap();
        let port = device.listen_port();

        let ep_a: SocketAddr = "127.1.0.3:12913".parse().unwrap();
        let ep_b: SocketAddr = "127.1.0.4:12913".parse().unwrap();
        let ip_a = Ipv4Addr::new(192, 169, 99, 3);
        let ip_b = Ipv4Addr::new(192, 169, 99, 4);

        device
            .apply_config(&config_text(
                private,
                port,
                &[(peer_a, ep_a, ip_a), (peer_b, ep_b, ip_b)],
            ))
            .await
            .unwrap();
        assert_eq!(device.peer_status().await.len(), 2);

        // Re-applying the identical config is a no-op.
        device
            .apply_config(&config_text(
                private,
                port,
                &[(peer_a, ep_a, ip_a), (peer_b, ep_b, ip_b)],
            ))
            .await
            .unwrap();
        assert_eq!(device.peer_status().await.len(), 2);

        // Drop peer B, move peer A's endpoint.
        let ep_a2: SocketAddr = "127.1.0.9:12913".parse().unwrap();
        device
            .apply_config(&config_text(private, port, &[(peer_a, ep_a2, ip_a)]))
            .await
            .unwrap();
        let status = device.peer_status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].public_key, peer_a);
        assert_eq!(status[0].endpoint, ep_a2);
    }

    #[tokio::test]
    async fn test_apply_config_rejects_private_key_change() {
        let (private, _) = keys::derive_keypair(&[1u8; 32]);
        let (other, _) = keys::derive_keypair(&[9u8; 32]);

        let (tun, _handle) = MemTun::new("mesh-test");
        let device = WireguardDevice::create(Box::new(tun), 0, private, ShutdownToken::new())
            .await
            .unwrap();
        let port = device.listen_port();

        let result = device.apply_config(&config_text(other, port, &[])).await;
        assert!(matches!(result, Err(OverlayError::Config(_))));
    }

    /// Two in-memory devices handshake over loopback UDP and deliver an IP
    /// packet end to end.
    #[tokio::test]
    async fn test_packet_crosses_between_devices() {
        let (priv_a, pub_a) = keys::derive_keypair(&[11u8; 32]);
        let (priv_b, pub_b) = keys::derive_keypair(&[22u8; 32]);
        let addr_a = Ipv4Addr::new(192, 169, 99, 2);
        let addr_b = Ipv4Addr::new(192, 169, 99, 3);

        let (tun_a, handle_a) = MemTun::new("mesh-a");
        let (tun_b, mut handle_b) = MemTun::new("mesh-b");

        let token = ShutdownToken::new();
        let dev_a = WireguardDevice::create(Box::new(tun_a), 0, priv_a, token.child())
            .await
            .unwrap();
        let dev_b = WireguardDevice::create(Box::new(tun_b), 0, priv_b, token.child())
            .await
            .unwrap();

        let ep_a: SocketAddr = format!("127.0.0.1:{}", dev_a.listen_port()).parse().unwrap();
        let ep_b: SocketAddr = format!("127.0.0.1:{}", dev_b.listen_port()).parse().unwrap();

        dev_a
            .apply_config(&config_text(
                priv_a,
                dev_a.listen_port(),
                &[(pub_b, ep_b, addr_b)],
            ))
            .await
            .unwrap();
        dev_b
            .apply_config(&config_text(
                priv_b,
                dev_b.listen_port(),
                &[(pub_a, ep_a, addr_a)],
            ))
            .await
            .unwrap();

        dev_a.up();
        dev_b.up();

        // Minimal IPv4 packet A -> B.
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&28u16.to_be_bytes());
        packet[8] = 64; // ttl
        packet[9] = 17; // udp
        packet[12..16].copy_from_slice(&addr_a.octets());
        packet[16..20].copy_from_slice(&addr_b.octets());

        // Inject on A's TUN until the decrypted packet surfaces on B's TUN;
        // the first injections ride out the noise handshake.
        let delivered = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                handle_a.inject.send(Bytes::from(packet.clone())).await.ok();
                tokio::select! {
                    out = handle_b.outbound.recv() => break out,
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }
        })
        .await
        .expect("packet never crossed the overlay")
        .expect("device closed B's TUN");

        assert_eq!(ip::ipv4_src(&delivered), Some(addr_a));
        assert_eq!(ip::ipv4_dst(&delivered), Some(addr_b));

        token.cancel();
        dev_a.close().await;
        dev_b.close().await;
    }
}
