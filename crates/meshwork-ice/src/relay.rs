//! Datagram bridge between a tunnel and a local UDP socket
//!
//! The overlay's own encrypted packets ride the negotiated tunnel: on one
//! side the bridge listens on the per-peer loopback alias that the overlay
//! device uses as the peer's endpoint, on the other it feeds the local
//! overlay listen port. Transient socket errors are logged and skipped; the
//! bridge only gives up after a run of consecutive failures.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, trace};

use meshwork_tasks::ShutdownToken;

use crate::conn::IceConn;
use crate::error::{IceError, IceResult};

/// Tunnel path MTU; overlay packets never exceed this.
const BRIDGE_BUF: usize = 1500;

/// Consecutive-failure budget before declaring the bridge dead.
const MAX_BRIDGE_ERRORS: u32 = 32;

/// Relay datagrams both ways until cancellation (`Ok`) or a persistent
/// failure (`Err`).
///
/// `local_peer` seeds the local destination; when `None`, tunnel traffic is
/// dropped until a local sender shows up and is learned from its first
/// datagram.
pub async fn relay_datagrams(
    token: &ShutdownToken,
    conn: &IceConn,
    local: &UdpSocket,
    mut local_peer: Option<SocketAddr>,
) -> IceResult<()> {
    let mut tunnel_buf = [0u8; BRIDGE_BUF];
    let mut local_buf = [0u8; BRIDGE_BUF];
    let mut errors: u32 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            received = conn.recv(&mut tunnel_buf) => match received {
                Ok(n) => {
                    match local_peer {
                        Some(addr) => match local.send_to(&tunnel_buf[..n], addr).await {
                            Ok(_) => errors = 0,
                            Err(e) => {
                                debug!(%addr, "bridge write failed: {e}");
                                errors += 1;
                            }
                        },
                        None => trace!("dropping tunnel datagram, no local peer yet"),
                    }
                }
                Err(e) => {
                    debug!("tunnel read failed: {e}");
                    errors += 1;
                }
            },
            received = local.recv_from(&mut local_buf) => match received {
                Ok((n, from)) => {
                    local_peer = Some(from);
                    match conn.send(&local_buf[..n]).await {
                        Ok(_) => errors = 0,
                        Err(e) => {
                            debug!("tunnel write failed: {e}");
                            errors += 1;
                        }
                    }
                }
                Err(e) => {
                    debug!("bridge read failed: {e}");
                    errors += 1;
                }
            },
        }

        if errors > MAX_BRIDGE_ERRORS {
            return Err(IceError::Protocol("bridge error budget exhausted".into()));
        }
    }
}
