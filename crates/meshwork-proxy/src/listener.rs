//! Listener bindings and relay loops
//!
//! Each exposed service gets one accept loop: either a local listener whose
//! connections are dialed into the overlay (`forward_to_mesh`), or an
//! overlay listener whose connections are dialed to a local service
//! (`serve_from_mesh`). The [`ListenerBindings`] registry makes
//! registration idempotent — asking twice for the same address is a no-op,
//! never a second loop.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use meshwork_overlay::{OverlayListener, OverlayNet, OverlayStream};
use meshwork_tasks::ShutdownToken;

use crate::error::{ProxyError, ProxyResult};
use crate::forward::{forward_bounded, FORWARD_TIMEOUT};

/// How long a per-connection dial to the relay target may take.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after an accept error before trying again.
const ACCEPT_RETRY: Duration = Duration::from_secs(1);

/// Resolves the dial target for each accepted connection.
pub type TargetResolver = Arc<dyn Fn() -> SocketAddr + Send + Sync>;

/// Tracks which listen addresses already have a relay loop.
#[derive(Default)]
pub struct ListenerBindings {
    active: Mutex<HashMap<String, String>>,
}

impl ListenerBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an address for a service. Returns false when already claimed.
    pub fn claim(&self, key: &str, service: &str) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains_key(key) {
            return false;
        }
        active.insert(key.to_string(), service.to_string());
        true
    }

    /// Release an address when its relay loop ends.
    pub fn release(&self, key: &str) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Snapshot for status output: address -> service name.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Accept connections and relay each against the resolved target as its own
/// bounded session. Ends only when `token` is cancelled; accept errors are
/// logged and looped past.
pub async fn listen_and_relay(
    token: ShutdownToken,
    listener: Box<dyn OverlayListener>,
    dial_net: Arc<dyn OverlayNet>,
    target: TargetResolver,
) -> ProxyResult<()> {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            a = listener.accept() => a,
        };

        let stream = match accepted {
            Ok(stream) => stream,
            Err(e) => {
                if token.is_cancelled() {
                    break;
                }
                warn!("accept error: {e}");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY) => continue,
                }
            }
        };

        let addr = target();
        let upstream = match tokio::time::timeout(DIAL_TIMEOUT, dial_net.dial(addr)).await {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(e)) => {
                warn!(%addr, "relay dial failed: {e}");
                continue;
            }
            Err(_) => {
                warn!(%addr, "relay dial timed out");
                continue;
            }
        };

        let conn_token = token.child();
        tokio::spawn(async move {
            if let Err(e) =
                forward_session(conn_token, stream, upstream, FORWARD_TIMEOUT).await
            {
                debug!("forwarding session ended: {e}");
            }
        });
    }
    Ok(())
}

async fn forward_session(
    token: ShutdownToken,
    a: Box<dyn OverlayStream>,
    b: Box<dyn OverlayStream>,
    ceiling: Duration,
) -> ProxyResult<(u64, u64)> {
    forward_bounded(token, a, b, ceiling).await
}

/// Expose a remote service: listen on the local address (a per-peer
/// loopback alias) and relay each connection into the overlay.
pub async fn forward_to_mesh(
    token: ShutdownToken,
    bindings: Arc<ListenerBindings>,
    service: &str,
    local_net: Arc<dyn OverlayNet>,
    listen_addr: SocketAddr,
    overlay_net: Arc<dyn OverlayNet>,
    mesh_addr: SocketAddr,
) -> ProxyResult<()> {
    let key = listen_addr.to_string();
    if !bindings.claim(&key, service) {
        debug!(%listen_addr, service, "listener already bound");
        return Ok(());
    }

    let listener = match local_net.listen(listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            bindings.release(&key);
            return Err(ProxyError::Overlay(e));
        }
    };
    info!(%listen_addr, %mesh_addr, service, "forwarding into mesh");

    let result = listen_and_relay(
        token,
        listener,
        overlay_net,
        Arc::new(move || mesh_addr),
    )
    .await;
    bindings.release(&key);
    result
}

/// Serve a local service to the mesh: listen on the overlay and relay each
/// connection to the local address.
pub async fn serve_from_mesh(
    token: ShutdownToken,
    bindings: Arc<ListenerBindings>,
    service: &str,
    overlay_net: Arc<dyn OverlayNet>,
    mesh_listen_addr: SocketAddr,
    local_net: Arc<dyn OverlayNet>,
    local_addr: SocketAddr,
) -> ProxyResult<()> {
    let key = format!("mesh:{mesh_listen_addr}");
    if !bindings.claim(&key, service) {
        debug!(%mesh_listen_addr, service, "mesh listener already bound");
        return Ok(());
    }

    let listener = match overlay_net.listen(mesh_listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            bindings.release(&key);
            return Err(ProxyError::Overlay(e));
        }
    };
    info!(%mesh_listen_addr, %local_addr, service, "serving local service to mesh");

    let result = listen_and_relay(
        token,
        listener,
        local_net,
        Arc::new(move || local_addr),
    )
    .await;
    bindings.release(&key);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwork_overlay::MemNet;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    fn addr(text: &str) -> SocketAddr {
        text.parse().unwrap()
    }

    #[tokio::test]
    async fn test_bindings_claim_is_idempotent() {
        let bindings = ListenerBindings::new();
        assert!(bindings.claim("127.1.0.3:80", "web"));
        assert!(!bindings.claim("127.1.0.3:80", "web"));
        assert!(bindings.claim("127.1.0.4:80", "web"));

        bindings.release("127.1.0.3:80");
        assert!(bindings.claim("127.1.0.3:80", "web"));
        assert_eq!(bindings.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_double_registration_runs_one_loop() {
        let bindings = Arc::new(ListenerBindings::new());
        let net = Arc::new(MemNet::new());
        let token = ShutdownToken::new();

        let first = tokio::spawn(forward_to_mesh(
            token.clone(),
            bindings.clone(),
            "svc",
            net.clone(),
            addr("127.1.0.3:8080"),
            net.clone(),
            addr("192.169.99.3:8080"),
        ));
        // Let the first loop claim and bind.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Second registration for the same address: immediate no-op Ok.
        let second = forward_to_mesh(
            token.clone(),
            bindings.clone(),
            "svc",
            net.clone(),
            addr("127.1.0.3:8080"),
            net.clone(),
            addr("192.169.99.3:8080"),
        )
        .await;
        assert!(second.is_ok());
        assert_eq!(bindings.snapshot().len(), 1);

        token.cancel();
        timeout(Duration::from_secs(2), first)
            .await
            .expect("relay loop did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(bindings.snapshot().len(), 0);
    }

    #[tokio::test]
    async fn test_relay_carries_bytes_end_to_end() {
        let bindings = Arc::new(ListenerBindings::new());
        let net = Arc::new(MemNet::new());
        let token = ShutdownToken::new();

        // A "remote service" living on the overlay side.
        let service_listener = net.listen(addr("192.169.99.3:7000")).await.unwrap();
        let service = tokio::spawn(async move {
            let mut conn = service_listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(b"pong").await.unwrap();
            conn.flush().await.unwrap();
            buf
        });

        // The relay loop exposing it locally.
        tokio::spawn(forward_to_mesh(
            token.clone(),
            bindings.clone(),
            "svc",
            net.clone(),
            addr("127.1.0.3:7000"),
            net.clone(),
            addr("192.169.99.3:7000"),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A local client dials the alias and talks through the relay.
        let mut client = net.dial(addr("127.1.0.3:7000")).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();

        let mut reply = [0u8; 4];
        timeout(Duration::from_secs(2), client.read_exact(&mut reply))
            .await
            .expect("no reply through relay")
            .unwrap();
        assert_eq!(&reply, b"pong");
        assert_eq!(service.await.unwrap(), *b"ping");

        token.cancel();
    }

    #[tokio::test]
    async fn test_dial_failure_skips_connection_keeps_loop() {
        let bindings = Arc::new(ListenerBindings::new());
        let net = Arc::new(MemNet::new());
        let token = ShutdownToken::new();

        tokio::spawn(forward_to_mesh(
            token.clone(),
            bindings.clone(),
            "svc",
            net.clone(),
            addr("127.1.0.3:7001"),
            net.clone(),
            addr("192.169.99.3:7001"), // nothing listening there
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Dial goes through, upstream dial fails, connection is dropped...
        let mut client = net.dial(addr("127.1.0.3:7001")).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client not released")
            .unwrap();
        assert_eq!(n, 0);

        // ... and the loop is still alive for the next one.
        assert!(bindings.snapshot().contains_key("127.1.0.3:7001"));
        token.cancel();
    }
}
