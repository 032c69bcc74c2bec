//! Connection registry
//!
//! One negotiation attempt per peer-pair key, never more. The registry is
//! constructor-injected (owned by the agent aggregate), supports concurrent
//! lookup, and keeps terminal sessions queryable until they are explicitly
//! replaced or collected.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use meshwork_signal::SignalClient;
use meshwork_tasks::ShutdownToken;

use crate::agent::Credentials;
use crate::session::{NegotiationSession, Role, SessionConfig, SessionState};

/// Registry of negotiation sessions keyed by peer pair.
pub struct ConnectionRegistry {
    signal: Arc<SignalClient>,
    stun_servers: Vec<String>,
    token: ShutdownToken,
    sessions: RwLock<HashMap<String, Arc<NegotiationSession>>>,
}

impl ConnectionRegistry {
    /// Create a registry whose sessions are children of `token`.
    pub fn new(
        signal: Arc<SignalClient>,
        stun_servers: Vec<String>,
        token: ShutdownToken,
    ) -> Self {
        Self {
            signal,
            stun_servers,
            token,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn key(local: &str, remote: &str) -> String {
        format!("{local}_{remote}")
    }

    /// Request a tunnel to `remote` as the initiating side.
    ///
    /// While an attempt for the pair is non-terminal the existing session is
    /// returned unchanged — never two concurrent attempts for one pair. A
    /// terminal entry is cancelled (idempotent) and replaced with a fresh
    /// attempt.
    pub async fn request_connection(
        &self,
        local: &str,
        remote: &str,
        proxy_addr: SocketAddr,
    ) -> Arc<NegotiationSession> {
        let key = Self::key(local, remote);
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(&key) {
            if !existing.is_terminal() {
                debug!(%key, state = %existing.state(), "reusing in-flight session");
                return existing.clone();
            }
            info!(%key, state = %existing.state(), "replacing terminal session");
            existing.cancel();
        }

        let session =
            NegotiationSession::new(local, remote, Role::Initiator, self.token.child());
        sessions.insert(key, session.clone());
        self.spawn(session.clone(), proxy_addr, None);
        session
    }

    /// Register and start a responder session for an incoming auth message.
    ///
    /// Returns `None` when a non-terminal session for the pair already
    /// exists — the incoming request is a duplicate and the in-flight
    /// attempt wins.
    pub async fn accept_connection(
        &self,
        local: &str,
        remote: &str,
        remote_creds: Credentials,
        session_id: String,
        proxy_addr: SocketAddr,
    ) -> Option<Arc<NegotiationSession>> {
        let key = Self::key(local, remote);
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(&key) {
            if !existing.is_terminal() {
                debug!(%key, "ignoring auth for busy pair");
                return None;
            }
            existing.cancel();
        }

        let session =
            NegotiationSession::new(local, remote, Role::Responder, self.token.child());
        sessions.insert(key, session.clone());
        self.spawn_with_id(session.clone(), proxy_addr, Some(remote_creds), session_id);
        Some(session)
    }

    fn spawn(
        &self,
        session: Arc<NegotiationSession>,
        proxy_addr: SocketAddr,
        remote_creds: Option<Credentials>,
    ) {
        self.spawn_with_id(session, proxy_addr, remote_creds, random_session_id());
    }

    fn spawn_with_id(
        &self,
        session: Arc<NegotiationSession>,
        proxy_addr: SocketAddr,
        remote_creds: Option<Credentials>,
        session_id: String,
    ) {
        let signal = self.signal.clone();
        let config = SessionConfig {
            session_id,
            proxy_addr,
            stun_servers: self.stun_servers.clone(),
        };
        tokio::spawn(async move {
            let local = session.local_peer().to_string();
            let remote = session.remote_peer().to_string();
            if let Err(e) = session.run(signal, config, remote_creds).await {
                if e.is_cancellation() {
                    debug!(%local, %remote, "negotiation cancelled");
                } else {
                    warn!(%local, %remote, "negotiation failed: {e}");
                }
            }
        });
    }

    /// Look up the session for a pair.
    pub async fn get(&self, local: &str, remote: &str) -> Option<Arc<NegotiationSession>> {
        self.sessions
            .read()
            .await
            .get(&Self::key(local, remote))
            .cloned()
    }

    /// Whether the pair currently carries an established, non-terminal
    /// tunnel.
    pub async fn is_busy(&self, local: &str, remote: &str) -> bool {
        self.get(local, remote)
            .await
            .is_some_and(|s| s.is_busy())
    }

    /// Snapshot of every tracked session's state, for status output.
    pub async fn connection_states(&self) -> BTreeMap<String, SessionState> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(key, session)| (key.clone(), session.state()))
            .collect()
    }

    /// Drop terminal entries, returning how many were collected. Terminal
    /// sessions are already cancelled; this only frees the bookkeeping.
    pub async fn collect_terminal(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_terminal());
        before - sessions.len()
    }
}

fn random_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A relay that accepts connections and never answers, so sessions stay
    /// in flight until cancelled.
    async fn hanging_registry() -> ConnectionRegistry {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _hold = listener;
            std::future::pending::<()>().await;
        });
        let signal = Arc::new(SignalClient::new(format!("http://{addr}")).unwrap());
        ConnectionRegistry::new(signal, vec![], ShutdownToken::new())
    }

    fn proxy_addr() -> SocketAddr {
        "127.0.0.1:12913".parse().unwrap()
    }

    #[tokio::test]
    async fn test_request_connection_dedupes_in_flight() {
        let registry = hanging_registry().await;

        let first = registry
            .request_connection("alice", "bob", proxy_addr())
            .await;
        let second = registry
            .request_connection("alice", "bob", proxy_addr())
            .await;

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_terminal_session_is_replaced() {
        let registry = hanging_registry().await;

        let first = registry
            .request_connection("alice", "bob", proxy_addr())
            .await;
        first.cancel();
        // Give the session task a moment to settle into its terminal state.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(first.is_terminal());

        let second = registry
            .request_connection("alice", "bob", proxy_addr())
            .await;
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(registry.get("alice", "bob").await.is_some());
    }

    #[tokio::test]
    async fn test_distinct_pairs_do_not_share_sessions() {
        let registry = hanging_registry().await;
        let ab = registry
            .request_connection("alice", "bob", proxy_addr())
            .await;
        let ac = registry
            .request_connection("alice", "carol", proxy_addr())
            .await;
        assert!(!Arc::ptr_eq(&ab, &ac));

        let states = registry.connection_states().await;
        assert_eq!(states.len(), 2);
        assert!(states.contains_key("alice_bob"));
        assert!(states.contains_key("alice_carol"));
    }

    #[tokio::test]
    async fn test_collect_terminal_keeps_active_entries() {
        let registry = hanging_registry().await;
        let session = registry
            .request_connection("alice", "bob", proxy_addr())
            .await;
        assert_eq!(registry.collect_terminal().await, 0);

        session.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(registry.collect_terminal().await, 1);
        assert!(registry.get("alice", "bob").await.is_none());
    }

    #[tokio::test]
    async fn test_is_busy_false_without_connection() {
        let registry = hanging_registry().await;
        registry
            .request_connection("alice", "bob", proxy_addr())
            .await;
        // Negotiation cannot complete against an unreachable relay, so the
        // session never reports busy.
        assert!(!registry.is_busy("alice", "bob").await);
        assert!(!registry.is_busy("alice", "nobody").await);
    }
}
