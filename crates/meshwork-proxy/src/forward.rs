//! The forwarding engine
//!
//! Copies bytes both ways between two duplex connections. A session ends
//! only once BOTH directions have completed (clean EOF or error) — one side
//! finishing alone leaves the other half-duplex stream flowing. Cancellation
//! closes both endpoints no matter what is in flight, and long-lived
//! single-connection relays get a hard lifetime ceiling so a half-open peer
//! cannot pin resources forever.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use meshwork_tasks::ShutdownToken;

use crate::error::{ProxyError, ProxyResult};

/// Hard ceiling on one relayed connection's lifetime.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const COPY_BUF: usize = 64 * 1024;

/// Relay bytes between `a` and `b` until both directions complete or the
/// token is cancelled. Returns the bytes copied `(a_to_b, b_to_a)`.
pub async fn forward<A, B>(token: ShutdownToken, a: A, b: B) -> ProxyResult<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let a_to_b = tokio::spawn(copy_direction(token.clone(), a_read, b_write));
    let b_to_a = tokio::spawn(copy_direction(token.clone(), b_read, a_write));

    // Two completions required, one per direction.
    let forward_bytes = a_to_b
        .await
        .map_err(|e| ProxyError::TaskFailed(e.to_string()))?;
    let reverse_bytes = b_to_a
        .await
        .map_err(|e| ProxyError::TaskFailed(e.to_string()))?;

    Ok((forward_bytes, reverse_bytes))
}

/// Like [`forward`], but the session is forcibly torn down after `ceiling`
/// even if still active.
pub async fn forward_bounded<A, B>(
    token: ShutdownToken,
    a: A,
    b: B,
    ceiling: Duration,
) -> ProxyResult<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let session = token.child();
    let timer = session.clone();
    let guard = tokio::spawn(async move {
        tokio::select! {
            _ = timer.cancelled() => {}
            _ = tokio::time::sleep(ceiling) => {
                warn!("forwarding session hit its lifetime ceiling");
                timer.cancel();
            }
        }
    });

    let result = forward(session.clone(), a, b).await;
    session.cancel();
    let _ = guard.await;
    result
}

/// One direction of a session. On EOF, error or cancellation the write side
/// of the destination is shut down — that endpoint closes exactly once,
/// here.
async fn copy_direction<R, W>(token: ShutdownToken, mut reader: R, mut writer: W) -> u64
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut total: u64 = 0;

    loop {
        let n = tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break, // clean EOF
                Ok(n) => n,
                Err(e) => {
                    debug!("copy read ended: {e}");
                    break;
                }
            },
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!("copy write ended: {e}");
            break;
        }
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    /// Spec seed test: one pipe reaching EOF leaves the session running;
    /// only both EOFs complete it.
    #[tokio::test]
    async fn test_session_needs_both_completions() {
        let (mut client_a, server_a) = tokio::io::duplex(1024);
        let (client_b, server_b) = tokio::io::duplex(1024);

        let token = ShutdownToken::new();
        let mut session =
            tokio::spawn(forward(token.clone(), server_a, server_b));

        // Close only side A.
        client_a.shutdown().await.unwrap();
        drop(client_a);

        tokio::select! {
            _ = &mut session => panic!("session ended with one direction still open"),
            _ = tokio::time::sleep(Duration::from_millis(300)) => {}
        }

        // Close side B as well: now the session completes.
        drop(client_b);
        let result = timeout(Duration::from_secs(2), session)
            .await
            .expect("session did not complete after both closures")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (mut client_a, server_a) = tokio::io::duplex(1024);
        let (mut client_b, server_b) = tokio::io::duplex(1024);

        let token = ShutdownToken::new();
        let session = tokio::spawn(forward(token.clone(), server_a, server_b));

        client_a.write_all(b"question").await.unwrap();
        let mut buf = [0u8; 8];
        client_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"question");

        client_b.write_all(b"answer!").await.unwrap();
        let mut buf = [0u8; 7];
        client_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"answer!");

        drop(client_a);
        drop(client_b);
        let (sent, received) = timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(sent, 8);
        assert_eq!(received, 7);
    }

    #[tokio::test]
    async fn test_cancellation_closes_both_sides() {
        let (mut client_a, server_a) = tokio::io::duplex(1024);
        let (mut client_b, server_b) = tokio::io::duplex(1024);

        let token = ShutdownToken::new();
        let session = tokio::spawn(forward(token.clone(), server_a, server_b));

        token.cancel();
        timeout(Duration::from_secs(2), session)
            .await
            .expect("cancelled session did not end")
            .unwrap()
            .unwrap();

        // Both peers observe EOF.
        let mut buf = [0u8; 1];
        assert_eq!(client_a.read(&mut buf).await.unwrap(), 0);
        assert_eq!(client_b.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lifetime_ceiling_tears_down_active_session() {
        let (mut client_a, server_a) = tokio::io::duplex(1024);
        let (mut client_b, server_b) = tokio::io::duplex(1024);

        let token = ShutdownToken::new();
        let session = tokio::spawn(forward_bounded(
            token.clone(),
            server_a,
            server_b,
            Duration::from_millis(200),
        ));

        // Session is alive and forwarding...
        client_a.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client_b.read_exact(&mut buf).await.unwrap();

        // ... and still gets torn down at the ceiling.
        timeout(Duration::from_secs(2), session)
            .await
            .expect("ceiling did not end the session")
            .unwrap()
            .unwrap();
        assert!(!token.is_cancelled(), "ceiling must not cancel the parent");
    }
}
