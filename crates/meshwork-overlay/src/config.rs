//! Overlay configuration
//!
//! Turns a device-directory snapshot into the peer-list configuration the
//! overlay device consumes, expressed in the WireGuard cross-platform
//! configuration protocol (`key=value` lines: `private_key` and
//! `listen_port`, then one block per peer).
//!
//! Addressing is positional: a device's index in the directory snapshot
//! determines both its overlay address and the loopback alias its tunnel
//! endpoint lives on, so every agent derives identical addressing without
//! coordination. Deleted directory slots are skipped but never reused.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tracing::debug;

use crate::error::{OverlayError, OverlayResult};
use crate::keys;

/// UDP port the overlay device listens on.
pub const OVERLAY_LISTEN_PORT: u16 = 12912;

/// Port on the per-peer loopback alias where the negotiated tunnel ends.
pub const TUNNEL_PROXY_PORT: u16 = 12913;

/// Keepalive pushed into every peer block.
pub const KEEPALIVE_SECS: u16 = 25;

/// MTU of the overlay interface.
pub const OVERLAY_MTU: u16 = 1420;

/// DNS fallbacks configured on the overlay interface.
pub const DNS_FALLBACKS: [Ipv4Addr; 2] = [
    Ipv4Addr::new(8, 8, 8, 8),
    Ipv4Addr::new(8, 8, 4, 4),
];

/// Overlay address of the device at `index` in the directory snapshot.
pub fn overlay_address(index: usize) -> Ipv4Addr {
    Ipv4Addr::new(192, 169, 99, index as u8 + 2)
}

/// Loopback alias carrying the tunnel endpoint for the device at `index`.
pub fn loopback_alias(index: usize) -> Ipv4Addr {
    Ipv4Addr::new(127, 1, 0, index as u8 + 2)
}

/// The slice of a directory record the overlay cares about.
#[derive(Debug, Clone)]
pub struct DirectoryPeer {
    /// Public identity key of the device.
    pub authority: String,
    /// Human name, used only for logs and status output.
    pub hostname: String,
    /// Whether the device is registered and should take part in the mesh.
    /// Deleted or pending devices keep their slot with `registered: false`.
    pub registered: bool,
}

/// One peer block of the generated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayPeer {
    pub authority: String,
    pub public_key: [u8; 32],
    pub endpoint: SocketAddr,
    /// Single-host route: this peer owns exactly its own overlay address.
    pub allowed_ip: Ipv4Addr,
    pub keepalive: u16,
}

/// A complete generated overlay configuration.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub local_address: Ipv4Addr,
    pub listen_port: u16,
    pub private_key: [u8; 32],
    pub peers: Vec<OverlayPeer>,
    /// Devices excluded from this generation because their overlay key is
    /// not yet published. Retried on the next topology refresh.
    pub offline: Vec<String>,
}

impl OverlayConfig {
    /// Render as configuration-protocol text.
    pub fn to_uapi(&self) -> String {
        let mut text = format!(
            "private_key={}\nlisten_port={}",
            keys::encode_key(&self.private_key),
            self.listen_port,
        );
        for peer in &self.peers {
            text.push_str(&format!(
                "\npublic_key={}\nendpoint={}\nallowed_ip={}/32\npersistent_keepalive_interval={}",
                keys::encode_key(&peer.public_key),
                peer.endpoint,
                peer.allowed_ip,
                peer.keepalive,
            ));
        }
        text
    }
}

/// Builds overlay configurations from directory snapshots.
pub struct OverlayConfigBuilder {
    local_authority: String,
    private_key: [u8; 32],
    listen_port: u16,
}

impl OverlayConfigBuilder {
    pub fn new(local_authority: impl Into<String>, private_key: [u8; 32], listen_port: u16) -> Self {
        Self {
            local_authority: local_authority.into(),
            private_key,
            listen_port,
        }
    }

    /// Generate a configuration for a snapshot.
    ///
    /// `resolve` maps a device authority to its published overlay public
    /// key; "not yet known" is a normal answer and marks that one peer
    /// offline rather than failing the build. Returns `None` — "not ready",
    /// not an error — until the local device itself appears in the snapshot
    /// with a resolvable key.
    pub fn build(
        &self,
        peers: &[DirectoryPeer],
        resolve: &dyn Fn(&str) -> Option<[u8; 32]>,
    ) -> Option<OverlayConfig> {
        let mut out = Vec::new();
        let mut offline = Vec::new();
        let mut local_address = None;

        for (index, peer) in peers.iter().enumerate() {
            if !peer.registered {
                continue;
            }
            if peer.authority == self.local_authority {
                if resolve(&peer.authority).is_some() {
                    local_address = Some(overlay_address(index));
                }
                continue;
            }
            match resolve(&peer.authority) {
                Some(public_key) => out.push(OverlayPeer {
                    authority: peer.authority.clone(),
                    public_key,
                    endpoint: SocketAddr::V4(SocketAddrV4::new(
                        loopback_alias(index),
                        TUNNEL_PROXY_PORT,
                    )),
                    allowed_ip: overlay_address(index),
                    keepalive: KEEPALIVE_SECS,
                }),
                None => {
                    debug!(authority = %peer.authority, host = %peer.hostname, "peer key unresolved, marking off");
                    offline.push(peer.authority.clone());
                }
            }
        }

        let local_address = match local_address {
            Some(addr) => addr,
            None => {
                debug!("local device not resolvable yet, skipping overlay config");
                return None;
            }
        };

        Some(OverlayConfig {
            local_address,
            listen_port: self.listen_port,
            private_key: self.private_key,
            peers: out,
            offline,
        })
    }
}

/// A peer block parsed back out of configuration-protocol text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UapiPeer {
    pub public_key: [u8; 32],
    pub endpoint: SocketAddr,
    pub allowed_ip: Ipv4Addr,
    pub keepalive: Option<u16>,
}

/// Parsed configuration-protocol text.
#[derive(Debug, Clone)]
pub struct UapiConfig {
    pub private_key: [u8; 32],
    pub listen_port: u16,
    pub peers: Vec<UapiPeer>,
}

/// Parse configuration-protocol text as produced by [`OverlayConfig::to_uapi`].
pub fn parse_uapi(text: &str) -> OverlayResult<UapiConfig> {
    let mut private_key = None;
    let mut listen_port = None;
    let mut peers: Vec<UapiPeer> = Vec::new();

    // Peer blocks start at each public_key line; fields accumulate until
    // the block is complete.
    let mut current: Option<PartialPeer> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| OverlayError::Config(format!("malformed line: {line}")))?;

        match key {
            "private_key" => {
                private_key = Some(
                    keys::decode_key(value)
                        .ok_or_else(|| OverlayError::Config("bad private_key".into()))?,
                );
            }
            "listen_port" => {
                listen_port = Some(
                    value
                        .parse()
                        .map_err(|_| OverlayError::Config("bad listen_port".into()))?,
                );
            }
            "public_key" => {
                if let Some(done) = current.take() {
                    peers.push(done.finish()?);
                }
                current = Some(PartialPeer::new(
                    keys::decode_key(value)
                        .ok_or_else(|| OverlayError::Config("bad public_key".into()))?,
                ));
            }
            "endpoint" => {
                let peer = current
                    .as_mut()
                    .ok_or_else(|| OverlayError::Config("endpoint outside peer block".into()))?;
                peer.endpoint = Some(
                    value
                        .parse()
                        .map_err(|_| OverlayError::Config(format!("bad endpoint: {value}")))?,
                );
            }
            "allowed_ip" => {
                let peer = current
                    .as_mut()
                    .ok_or_else(|| OverlayError::Config("allowed_ip outside peer block".into()))?;
                let ip = value.split('/').next().unwrap_or(value);
                peer.allowed_ip = Some(
                    ip.parse()
                        .map_err(|_| OverlayError::Config(format!("bad allowed_ip: {value}")))?,
                );
            }
            "persistent_keepalive_interval" => {
                let peer = current
                    .as_mut()
                    .ok_or_else(|| OverlayError::Config("keepalive outside peer block".into()))?;
                peer.keepalive = value.parse().ok();
            }
            other => {
                return Err(OverlayError::Config(format!("unknown key: {other}")));
            }
        }
    }
    if let Some(done) = current.take() {
        peers.push(done.finish()?);
    }

    Ok(UapiConfig {
        private_key: private_key
            .ok_or_else(|| OverlayError::Config("missing private_key".into()))?,
        listen_port: listen_port
            .ok_or_else(|| OverlayError::Config("missing listen_port".into()))?,
        peers,
    })
}

struct PartialPeer {
    public_key: [u8; 32],
    endpoint: Option<SocketAddr>,
    allowed_ip: Option<Ipv4Addr>,
    keepalive: Option<u16>,
}

impl PartialPeer {
    fn new(public_key: [u8; 32]) -> Self {
        Self {
            public_key,
            endpoint: None,
            allowed_ip: None,
            keepalive: None,
        }
    }

    fn finish(self) -> OverlayResult<UapiPeer> {
        Ok(UapiPeer {
            public_key: self.public_key,
            endpoint: self
                .endpoint
                .ok_or_else(|| OverlayError::Config("peer missing endpoint".into()))?,
            allowed_ip: self
                .allowed_ip
                .ok_or_else(|| OverlayError::Config("peer missing allowed_ip".into()))?,
            keepalive: self.keepalive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn snapshot() -> Vec<DirectoryPeer> {
        vec![
            DirectoryPeer {
                authority: "dev-a".into(),
                hostname: "alpha".into(),
                registered: true,
            },
            DirectoryPeer {
                authority: "dev-b".into(),
                hostname: "bravo".into(),
                registered: true,
            },
            DirectoryPeer {
                authority: "dev-c".into(),
                hostname: "charlie".into(),
                registered: false,
            },
            DirectoryPeer {
                authority: "dev-d".into(),
                hostname: "delta".into(),
                registered: true,
            },
        ]
    }

    fn keys_for(resolvable: &[&str]) -> HashMap<String, [u8; 32]> {
        resolvable
            .iter()
            .enumerate()
            .map(|(i, a)| (a.to_string(), [i as u8 + 1; 32]))
            .collect()
    }

    #[test]
    fn test_build_excludes_local_and_unresolved() {
        let builder = OverlayConfigBuilder::new("dev-a", [9u8; 32], OVERLAY_LISTEN_PORT);
        let known = keys_for(&["dev-a", "dev-b"]);
        let config = builder
            .build(&snapshot(), &|a| known.get(a).copied())
            .expect("local key resolvable, config expected");

        // dev-b resolved, dev-c unregistered, dev-d unresolved.
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].authority, "dev-b");
        assert_eq!(config.offline, vec!["dev-d".to_string()]);
        assert!(config.peers.iter().all(|p| p.authority != "dev-a"));

        // Addressing is positional: dev-a at slot 0, dev-b at slot 1.
        assert_eq!(config.local_address, Ipv4Addr::new(192, 169, 99, 2));
        assert_eq!(config.peers[0].allowed_ip, Ipv4Addr::new(192, 169, 99, 3));
        assert_eq!(
            config.peers[0].endpoint,
            "127.1.0.3:12913".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_build_not_ready_without_local_key() {
        let builder = OverlayConfigBuilder::new("dev-a", [9u8; 32], OVERLAY_LISTEN_PORT);
        let known = keys_for(&["dev-b", "dev-d"]);
        assert!(builder.build(&snapshot(), &|a| known.get(a).copied()).is_none());
    }

    #[test]
    fn test_build_not_ready_when_local_absent() {
        let builder = OverlayConfigBuilder::new("dev-x", [9u8; 32], OVERLAY_LISTEN_PORT);
        let known = keys_for(&["dev-a", "dev-b", "dev-x"]);
        assert!(builder.build(&snapshot(), &|a| known.get(a).copied()).is_none());
    }

    #[test]
    fn test_peer_subnets_are_distinct_single_hosts() {
        let builder = OverlayConfigBuilder::new("dev-a", [9u8; 32], OVERLAY_LISTEN_PORT);
        let known = keys_for(&["dev-a", "dev-b", "dev-c", "dev-d"]);
        let config = builder
            .build(&snapshot(), &|a| known.get(a).copied())
            .unwrap();

        let mut addrs: Vec<_> = config.peers.iter().map(|p| p.allowed_ip).collect();
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), config.peers.len());
    }

    #[test]
    fn test_uapi_round_trip() {
        let builder = OverlayConfigBuilder::new("dev-a", [9u8; 32], OVERLAY_LISTEN_PORT);
        let known = keys_for(&["dev-a", "dev-b", "dev-d"]);
        let config = builder
            .build(&snapshot(), &|a| known.get(a).copied())
            .unwrap();

        let text = config.to_uapi();
        let parsed = parse_uapi(&text).unwrap();

        assert_eq!(parsed.private_key, config.private_key);
        assert_eq!(parsed.listen_port, config.listen_port);
        assert_eq!(parsed.peers.len(), config.peers.len());
        for (parsed_peer, built) in parsed.peers.iter().zip(&config.peers) {
            assert_eq!(parsed_peer.public_key, built.public_key);
            assert_eq!(parsed_peer.endpoint, built.endpoint);
            assert_eq!(parsed_peer.allowed_ip, built.allowed_ip);
            assert_eq!(parsed_peer.keepalive, Some(built.keepalive));
        }
    }

    #[test]
    fn test_parse_uapi_rejects_incomplete_blocks() {
        assert!(parse_uapi("listen_port=12912").is_err());
        assert!(parse_uapi("private_key=zz\nlisten_port=12912").is_err());
        let missing_endpoint = format!(
            "private_key={}\nlisten_port=12912\npublic_key={}",
            "aa".repeat(32),
            "bb".repeat(32),
        );
        assert!(parse_uapi(&missing_endpoint).is_err());
    }
}
