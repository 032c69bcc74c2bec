//! Negotiation sessions
//!
//! A session drives one tunnel attempt between a local and a remote peer
//! name through its full life: credential exchange over the auth channel,
//! candidate exchange over the plain channel, connectivity checks, and —
//! once connected — the datagram bridge between the tunnel and the local
//! proxy socket. The protocol itself enforces the ordering: credentials
//! before candidates before checks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use meshwork_signal::{Channel, SignalClient, SignalMessage};
use meshwork_tasks::ShutdownToken;

use crate::agent::{Credentials, IceAgent};
use crate::candidate::Candidate;
use crate::error::{IceError, IceResult};
use crate::relay;

/// Connectivity state of a negotiation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing started yet
    New,
    /// Gathering local candidates
    Gathering,
    /// Exchanging credentials and candidates through signaling
    Exchanging,
    /// Running connectivity checks
    Checking,
    /// Tunnel established
    Connected,
    /// Negotiation or tunnel failed
    Failed,
    /// Tunnel was established and then lost
    Disconnected,
    /// Torn down by cancellation
    Closed,
}

impl SessionState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Failed | SessionState::Disconnected | SessionState::Closed
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionState::New => "new",
            SessionState::Gathering => "gathering",
            SessionState::Exchanging => "exchanging",
            SessionState::Checking => "checking",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Disconnected => "disconnected",
            SessionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Which side of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We asked for the tunnel and sent the first auth message.
    Initiator,
    /// We answered an auth message pulled from our own auth channel.
    Responder,
}

/// Per-session parameters supplied by the caller.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Opaque id correlating both sides' logs.
    pub session_id: String,
    /// Local UDP address the tunnel bridges to: the initiator listens on it
    /// (the per-peer loopback alias), the responder sends to it (the local
    /// overlay listen port).
    pub proxy_addr: SocketAddr,
    /// STUN servers for candidate gathering.
    pub stun_servers: Vec<String>,
}

/// One tunnel negotiation attempt between two peer names.
pub struct NegotiationSession {
    local: String,
    remote: String,
    role: Role,
    state: Mutex<SessionState>,
    connected: AtomicBool,
    token: ShutdownToken,
}

impl NegotiationSession {
    pub(crate) fn new(
        local: impl Into<String>,
        remote: impl Into<String>,
        role: Role,
        token: ShutdownToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            local: local.into(),
            remote: remote.into(),
            role,
            state: Mutex::new(SessionState::New),
            connected: AtomicBool::new(false),
            token,
        })
    }

    /// Local peer name.
    pub fn local_peer(&self) -> &str {
        &self.local
    }

    /// Remote peer name.
    pub fn remote_peer(&self) -> &str {
        &self.remote
    }

    /// Handshake role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current connectivity state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// A session is busy only when it carries an established tunnel whose
    /// state has not gone terminal.
    pub fn is_busy(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.is_terminal()
    }

    /// Cancel the session and everything running under it. Idempotent;
    /// returns `true` only for the call that performed the cancellation.
    pub fn cancel(&self) -> bool {
        self.token.cancel()
    }

    /// The session's cancellation token.
    pub fn token(&self) -> &ShutdownToken {
        &self.token
    }

    fn transition(&self, next: SessionState) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.is_terminal() {
                return;
            }
            debug!(
                local = %self.local,
                remote = %self.remote,
                from = %state,
                to = %next,
                "session state change"
            );
            *state = next;
        }
        if next == SessionState::Connected {
            self.connected.store(true, Ordering::SeqCst);
        }
        // Reaching a terminal state tears the whole session down: candidate
        // pulls, checks, and any bridge running on top.
        if next.is_terminal() && self.token.cancel() {
            debug!(local = %self.local, remote = %self.remote, "session cancelled by terminal state");
        }
    }

    /// Drive the session to completion. Intended to run as its own task.
    pub(crate) async fn run(
        self: Arc<Self>,
        signal: Arc<SignalClient>,
        config: SessionConfig,
        responder_creds: Option<Credentials>,
    ) -> IceResult<()> {
        let result = self.negotiate(&signal, &config, responder_creds).await;
        match &result {
            Ok(()) => {}
            Err(e) if e.is_cancellation() => self.transition(SessionState::Closed),
            Err(_) => self.transition(SessionState::Failed),
        }
        result
    }

    async fn negotiate(
        &self,
        signal: &SignalClient,
        config: &SessionConfig,
        responder_creds: Option<Credentials>,
    ) -> IceResult<()> {
        let token = self.token.clone();
        info!(
            local = %self.local,
            remote = %self.remote,
            role = ?self.role,
            session = %config.session_id,
            "starting negotiation"
        );

        let agent = IceAgent::bind(config.stun_servers.clone()).await?;
        let local_creds = agent.credentials().clone();

        // Start pulling our candidate channel before anything is pushed so
        // the remote's candidate message is never missed.
        let candidate_pull = token.child();
        let mut candidate_rx = signal.pull(candidate_pull.clone(), &Channel::candidates(&self.local));

        self.transition(SessionState::Gathering);

        // The initiator offers its credentials right away so the responder
        // can start gathering in parallel.
        if self.role == Role::Initiator {
            self.push(
                signal,
                &Channel::auth(&self.remote),
                SignalMessage::new()
                    .with("ufrag", &local_creds.ufrag)
                    .with("pwd", &local_creds.pwd)
                    .with("sessionid", &config.session_id)
                    .with("nodename", &self.local),
            )
            .await?;
        }

        let local_candidates = agent.gather().await?;

        self.transition(SessionState::Exchanging);

        let remote_creds = match (self.role, responder_creds) {
            (Role::Responder, Some(creds)) => {
                // Answer on the initiator's auth channel.
                self.push(
                    signal,
                    &Channel::auth(&self.remote),
                    SignalMessage::new()
                        .with("ufrag", &local_creds.ufrag)
                        .with("pwd", &local_creds.pwd),
                )
                .await?;
                creds
            }
            (Role::Initiator, _) => {
                let auth_pull = token.child();
                let mut auth_rx = signal.pull(auth_pull.clone(), &Channel::auth(&self.local));
                let reply = tokio::select! {
                    _ = token.cancelled() => return Err(IceError::Cancelled),
                    m = auth_rx.recv() => m.ok_or_else(|| closed_or_cancelled(&token))?,
                };
                auth_pull.cancel();
                parse_credentials(&reply)?
            }
            (Role::Responder, None) => {
                return Err(IceError::Protocol(
                    "responder session started without remote credentials".into(),
                ))
            }
        };

        // Publish our candidates on the peer's plain channel...
        let mut offer = SignalMessage::new().with("name", "candidate");
        for (i, candidate) in local_candidates.iter().enumerate() {
            offer.set(format!("candidate{i}"), candidate.marshal());
        }
        offer.set("count", local_candidates.len().to_string());
        self.push(signal, &Channel::candidates(&self.remote), offer)
            .await?;

        // ... and collect theirs from ours.
        let theirs = tokio::select! {
            _ = token.cancelled() => return Err(IceError::Cancelled),
            m = candidate_rx.recv() => m.ok_or_else(|| closed_or_cancelled(&token))?,
        };
        candidate_pull.cancel();
        let remote_candidates = parse_candidates(&theirs);
        if remote_candidates.is_empty() {
            return Err(IceError::NoCandidates);
        }

        self.transition(SessionState::Checking);

        let conn = match self.role {
            Role::Initiator => agent.dial(&token, remote_creds, remote_candidates).await?,
            Role::Responder => agent.accept(&token, remote_creds, remote_candidates).await?,
        };

        self.transition(SessionState::Connected);
        info!(
            local = %self.local,
            remote = %self.remote,
            selected = %conn.remote_addr(),
            "tunnel connected"
        );

        // Bridge the tunnel to the local proxy socket until teardown. The
        // initiator owns the per-peer alias and waits for local senders; the
        // responder pushes into the local overlay port.
        let (bridge, local_peer) = match self.role {
            Role::Initiator => (UdpSocket::bind(config.proxy_addr).await?, None),
            Role::Responder => (
                UdpSocket::bind("127.0.0.1:0").await?,
                Some(config.proxy_addr),
            ),
        };

        let bridged = relay::relay_datagrams(&token, &conn, &bridge, local_peer).await;
        match bridged {
            Ok(()) => {
                self.transition(SessionState::Closed);
                Ok(())
            }
            Err(e) => {
                warn!(local = %self.local, remote = %self.remote, "tunnel bridge lost: {e}");
                self.transition(SessionState::Disconnected);
                Ok(())
            }
        }
    }
}

impl NegotiationSession {
    /// Push that yields to session cancellation instead of riding out the
    /// HTTP timeout.
    async fn push(
        &self,
        signal: &SignalClient,
        channel: &Channel,
        message: SignalMessage,
    ) -> IceResult<()> {
        tokio::select! {
            _ = self.token.cancelled() => Err(IceError::Cancelled),
            pushed = signal.push(channel, message) => Ok(pushed?),
        }
    }
}

/// A pull that closes because its session is being torn down is
/// cancellation, not a failure.
fn closed_or_cancelled(token: &ShutdownToken) -> IceError {
    if token.is_cancelled() {
        IceError::Cancelled
    } else {
        IceError::ChannelClosed
    }
}

fn parse_credentials(message: &SignalMessage) -> IceResult<Credentials> {
    let ufrag = message
        .get("ufrag")
        .ok_or_else(|| IceError::Protocol("auth message missing ufrag".into()))?;
    let pwd = message
        .get("pwd")
        .ok_or_else(|| IceError::Protocol("auth message missing pwd".into()))?;
    Ok(Credentials {
        ufrag: ufrag.to_string(),
        pwd: pwd.to_string(),
    })
}

/// Decode up to `count` candidates, skipping anything malformed.
fn parse_candidates(message: &SignalMessage) -> Vec<Candidate> {
    let count: usize = message
        .get("count")
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);

    let mut candidates = Vec::new();
    for i in 0..count {
        let Some(text) = message.get(&format!("candidate{i}")) else {
            continue;
        };
        match Candidate::unmarshal(text) {
            Ok(candidate) => candidates.push(candidate),
            Err(e) => warn!("skipping candidate {i}: {e}"),
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!SessionState::New.is_terminal());
        assert!(!SessionState::Connected.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Disconnected.is_terminal());
        assert!(SessionState::Closed.is_terminal());
    }

    #[test]
    fn test_terminal_transition_cancels_once() {
        let session =
            NegotiationSession::new("a", "b", Role::Initiator, ShutdownToken::new());
        session.transition(SessionState::Gathering);
        assert!(!session.token().is_cancelled());

        session.transition(SessionState::Failed);
        assert!(session.token().is_cancelled());
        assert_eq!(session.state(), SessionState::Failed);

        // Terminal is final: no further transition, and the handle reports
        // the cancellation already happened.
        session.transition(SessionState::Connected);
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.cancel());
    }

    #[test]
    fn test_busy_requires_established_connection() {
        let session =
            NegotiationSession::new("a", "b", Role::Initiator, ShutdownToken::new());
        assert!(!session.is_busy());

        session.transition(SessionState::Connected);
        assert!(session.is_busy());

        session.transition(SessionState::Disconnected);
        assert!(!session.is_busy());
    }

    #[test]
    fn test_parse_candidates_skips_malformed() {
        let message = SignalMessage::new()
            .with("count", "3")
            .with("candidate0", "1 1 udp 2130706431 10.0.0.1 5000 typ host")
            .with("candidate1", "complete garbage")
            .with("candidate2", "2 1 udp 1694498815 203.0.113.5 6000 typ srflx");
        let parsed = parse_candidates(&message);
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_candidates_respects_count() {
        let message = SignalMessage::new()
            .with("count", "1")
            .with("candidate0", "1 1 udp 2130706431 10.0.0.1 5000 typ host")
            .with("candidate1", "1 1 udp 2130706431 10.0.0.2 5000 typ host");
        assert_eq!(parse_candidates(&message).len(), 1);
    }
}
