//! Per-session negotiation agent
//!
//! One [`IceAgent`] owns one UDP socket for the lifetime of a negotiation
//! attempt: candidate gathering, connectivity checks and — once a pair is
//! selected — the tunnel itself all use that socket, so the NAT mapping
//! discovered while gathering stays valid for the data path.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use meshwork_tasks::ShutdownToken;

use crate::candidate::Candidate;
use crate::check::{self, CheckPacket};
use crate::conn::IceConn;
use crate::error::{IceError, IceResult};
use crate::stun;

/// How long each STUN server gets to answer during gathering.
const STUN_WAIT: Duration = Duration::from_secs(3);

/// Interval between connectivity check bursts.
const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Overall ceiling for the connectivity check phase.
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Short-lived per-session credentials exchanged through signaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ufrag: String,
    pub pwd: String,
}

impl Credentials {
    /// Generate a fresh credential pair.
    pub fn generate() -> Self {
        Self {
            ufrag: random_token(8),
            pwd: random_token(24),
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// The negotiation engine for one session.
pub struct IceAgent {
    socket: Arc<UdpSocket>,
    credentials: Credentials,
    stun_servers: Vec<String>,
}

impl IceAgent {
    /// Bind a fresh session socket and mint credentials.
    pub async fn bind(stun_servers: Vec<String>) -> IceResult<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket: Arc::new(socket),
            credentials: Credentials::generate(),
            stun_servers,
        })
    }

    /// Our credentials for this session.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Local socket address.
    pub fn local_addr(&self) -> IceResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Gather local candidates: the host address of the session socket plus
    /// the server-reflexive mapping from the first STUN server that answers.
    pub async fn gather(&self) -> IceResult<Vec<Candidate>> {
        let port = self.local_addr()?.port();
        let mut candidates = Vec::new();

        match default_route_ip().await {
            Ok(ip) => candidates.push(Candidate::host(SocketAddr::new(ip, port))),
            Err(e) => debug!("no host candidate: {e}"),
        }

        for server in &self.stun_servers {
            match stun::mapped_address(&self.socket, server, STUN_WAIT).await {
                Ok(mapped) => {
                    if !candidates.iter().any(|c| c.addr == mapped) {
                        candidates.push(Candidate::server_reflexive(mapped));
                    }
                    break;
                }
                Err(e) => debug!(server = %server, "STUN gathering failed: {e}"),
            }
        }

        if candidates.is_empty() {
            return Err(IceError::NoCandidates);
        }
        debug!(count = candidates.len(), "gathered candidates");
        Ok(candidates)
    }

    /// Run connectivity checks as the initiating side.
    pub async fn dial(
        &self,
        token: &ShutdownToken,
        remote: Credentials,
        remote_candidates: Vec<Candidate>,
    ) -> IceResult<IceConn> {
        self.connect(token, remote, remote_candidates).await
    }

    /// Run connectivity checks as the accepting side.
    pub async fn accept(
        &self,
        token: &ShutdownToken,
        remote: Credentials,
        remote_candidates: Vec<Candidate>,
    ) -> IceResult<IceConn> {
        self.connect(token, remote, remote_candidates).await
    }

    /// The check loop itself. Both roles behave the same way: send
    /// authenticated requests to every remote candidate on a fixed cadence,
    /// answer every valid request that arrives, and finish on the first
    /// valid response — proof that the path works in both directions.
    async fn connect(
        &self,
        token: &ShutdownToken,
        remote: Credentials,
        mut remote_candidates: Vec<Candidate>,
    ) -> IceResult<IceConn> {
        if remote_candidates.is_empty() {
            return Err(IceError::NoCandidates);
        }
        remote_candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        remote_candidates.dedup_by_key(|c| c.addr);

        let deadline = Instant::now() + CHECK_TIMEOUT;
        let mut send_tick = tokio::time::interval(CHECK_INTERVAL);
        let mut seq: u32 = 0;
        let mut buf = [0u8; 1500];

        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(IceError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(IceError::CheckTimeout),
                _ = send_tick.tick() => {
                    seq += 1;
                    let request = check::encode(&CheckPacket::Request {
                        to_ufrag: remote.ufrag.clone(),
                        to_pwd: remote.pwd.clone(),
                        from_ufrag: self.credentials.ufrag.clone(),
                        seq,
                    })?;
                    for candidate in &remote_candidates {
                        if let Err(e) = self.socket.send_to(&request, candidate.addr).await {
                            trace!(addr = %candidate.addr, "check send failed: {e}");
                        }
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (n, from) = received?;
                    match check::decode(&buf[..n]) {
                        Some(CheckPacket::Request { to_ufrag, to_pwd, seq: their_seq, .. })
                            if to_ufrag == self.credentials.ufrag
                                && to_pwd == self.credentials.pwd =>
                        {
                            trace!(%from, "answering connectivity check");
                            let response = check::encode(&CheckPacket::Response {
                                to_ufrag: remote.ufrag.clone(),
                                to_pwd: remote.pwd.clone(),
                                ack_seq: their_seq,
                            })?;
                            let _ = self.socket.send_to(&response, from).await;
                        }
                        Some(CheckPacket::Response { to_ufrag, to_pwd, ack_seq })
                            if to_ufrag == self.credentials.ufrag
                                && to_pwd == self.credentials.pwd =>
                        {
                            debug!(%from, ack_seq, "connectivity check succeeded");
                            return Ok(IceConn::new(
                                self.socket.clone(),
                                from,
                                self.credentials.clone(),
                                remote,
                            ));
                        }
                        Some(_) => warn!(%from, "check with wrong credentials"),
                        None => trace!(%from, "non-check datagram during checks"),
                    }
                }
            }
        }
    }
}

/// Local IP on the default route, learned without sending a packet by
/// "connecting" a UDP socket to a public address.
async fn default_route_ip() -> IceResult<IpAddr> {
    let probe = UdpSocket::bind("0.0.0.0:0").await?;
    probe
        .connect((Ipv4Addr::new(8, 8, 8, 8), 53))
        .await?;
    Ok(probe.local_addr()?.ip())
}
