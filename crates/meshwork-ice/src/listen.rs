//! Responder side of the handshake
//!
//! Every agent pulls its own auth channel from the moment it starts, so an
//! initiator's first push is never lost. Each auth message that arrives
//! spawns a responder session through the registry, which also shields us
//! from duplicate requests for a pair that is already negotiating.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use meshwork_signal::{Channel, SignalClient};
use meshwork_tasks::ShutdownToken;

use crate::agent::Credentials;
use crate::registry::ConnectionRegistry;

/// Start answering tunnel requests addressed to `local_name`.
///
/// Runs until `token` is cancelled. `proxy_addr` is where accepted tunnels
/// deliver their datagrams — the local overlay listen port.
pub fn listen_for_requests(
    registry: Arc<ConnectionRegistry>,
    signal: Arc<SignalClient>,
    token: ShutdownToken,
    local_name: String,
    proxy_addr: SocketAddr,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut auth_rx = signal.pull(token.clone(), &Channel::auth(&local_name));
        info!(name = %local_name, "listening for tunnel requests");

        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                m = auth_rx.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
            };

            let (Some(ufrag), Some(pwd)) = (message.get("ufrag"), message.get("pwd")) else {
                warn!(name = %local_name, "auth message missing credentials");
                continue;
            };
            let Some(remote) = message.get("nodename") else {
                warn!(name = %local_name, "auth message missing nodename");
                continue;
            };
            let session_id = message.get("sessionid").unwrap_or("").to_string();

            let creds = Credentials {
                ufrag: ufrag.to_string(),
                pwd: pwd.to_string(),
            };
            if registry
                .accept_connection(&local_name, remote, creds, session_id, proxy_addr)
                .await
                .is_some()
            {
                info!(name = %local_name, %remote, "accepted tunnel request");
            }
        }
        info!(name = %local_name, "stopped listening for tunnel requests");
    })
}
