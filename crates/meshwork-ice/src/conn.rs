//! The negotiated tunnel endpoint

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::trace;

use crate::agent::Credentials;
use crate::check::{self, CheckPacket};
use crate::error::IceResult;

/// A datagram duplex over the selected candidate pair.
///
/// Wraps the session socket once the connectivity checks picked a working
/// remote address. Late connectivity checks from the peer (retransmitted
/// while our side already finished) are answered transparently inside
/// [`IceConn::recv`] so the peer's checks converge too.
pub struct IceConn {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    local_creds: Credentials,
    remote_creds: Credentials,
}

impl IceConn {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        local_creds: Credentials,
        remote_creds: Credentials,
    ) -> Self {
        Self {
            socket,
            remote,
            local_creds,
            remote_creds,
        }
    }

    /// The selected remote address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// The local socket address.
    pub fn local_addr(&self) -> IceResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one datagram to the peer.
    pub async fn send(&self, data: &[u8]) -> IceResult<usize> {
        Ok(self.socket.send_to(data, self.remote).await?)
    }

    /// Receive one payload datagram from the peer.
    ///
    /// Datagrams from other sources are dropped; check packets are answered
    /// and skipped.
    pub async fn recv(&self, buf: &mut [u8]) -> IceResult<usize> {
        loop {
            let (n, from) = self.socket.recv_from(buf).await?;
            if from != self.remote {
                trace!(%from, "dropping datagram from unselected source");
                continue;
            }
            match check::decode(&buf[..n]) {
                Some(CheckPacket::Request {
                    to_ufrag,
                    to_pwd,
                    seq,
                    ..
                }) if to_ufrag == self.local_creds.ufrag
                    && to_pwd == self.local_creds.pwd =>
                {
                    let response = CheckPacket::Response {
                        to_ufrag: self.remote_creds.ufrag.clone(),
                        to_pwd: self.remote_creds.pwd.clone(),
                        ack_seq: seq,
                    };
                    if let Ok(bytes) = check::encode(&response) {
                        let _ = self.socket.send_to(&bytes, from).await;
                    }
                    continue;
                }
                Some(_) => continue,
                None => return Ok(n),
            }
        }
    }
}

impl std::fmt::Debug for IceConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceConn")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}
