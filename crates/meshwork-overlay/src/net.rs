//! Dial/listen seam over the overlay stack
//!
//! The forwarding engine talks to the overlay through this trait rather
//! than to sockets directly. In production the OS routes the overlay subnet
//! through the TUN interface, so [`TcpOverlayNet`] is ordinary TCP; the
//! in-memory [`MemNet`] stands in for it wherever tests need an overlay
//! without an interface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use crate::error::{OverlayError, OverlayResult};

/// A byte-duplex carried over the overlay.
pub trait OverlayStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> OverlayStream for T {}

/// Accepts inbound overlay connections.
#[async_trait]
pub trait OverlayListener: Send + Sync {
    async fn accept(&self) -> OverlayResult<Box<dyn OverlayStream>>;
    fn local_addr(&self) -> OverlayResult<SocketAddr>;
}

/// Dial and listen over the overlay's virtual IP stack.
#[async_trait]
pub trait OverlayNet: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> OverlayResult<Box<dyn OverlayStream>>;
    async fn listen(&self, addr: SocketAddr) -> OverlayResult<Box<dyn OverlayListener>>;
}

/// The production overlay net: plain TCP, routed through the TUN interface
/// by the OS.
#[derive(Debug, Default, Clone)]
pub struct TcpOverlayNet;

#[async_trait]
impl OverlayNet for TcpOverlayNet {
    async fn dial(&self, addr: SocketAddr) -> OverlayResult<Box<dyn OverlayStream>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| OverlayError::Net(format!("dial {addr}: {e}")))?;
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: SocketAddr) -> OverlayResult<Box<dyn OverlayListener>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| OverlayError::Net(format!("listen {addr}: {e}")))?;
        Ok(Box::new(TcpOverlayListener { listener }))
    }
}

struct TcpOverlayListener {
    listener: TcpListener,
}

#[async_trait]
impl OverlayListener for TcpOverlayListener {
    async fn accept(&self) -> OverlayResult<Box<dyn OverlayStream>> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| OverlayError::Net(format!("accept: {e}")))?;
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> OverlayResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// In-memory overlay net for tests: listeners are registered by address,
/// dials hand the listener one end of a duplex pipe.
#[derive(Clone, Default)]
pub struct MemNet {
    listeners: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Box<dyn OverlayStream>>>>>,
}

impl MemNet {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OverlayNet for MemNet {
    async fn dial(&self, addr: SocketAddr) -> OverlayResult<Box<dyn OverlayStream>> {
        let sender = self
            .listeners
            .lock()
            .await
            .get(&addr)
            .cloned()
            .ok_or_else(|| OverlayError::Net(format!("nothing listening on {addr}")))?;

        let (near, far) = tokio::io::duplex(64 * 1024);
        sender
            .send(Box::new(far))
            .await
            .map_err(|_| OverlayError::Net(format!("listener on {addr} gone")))?;
        Ok(Box::new(near))
    }

    async fn listen(&self, addr: SocketAddr) -> OverlayResult<Box<dyn OverlayListener>> {
        let (tx, rx) = mpsc::channel(16);
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&addr) {
            return Err(OverlayError::Net(format!("{addr} already bound")));
        }
        listeners.insert(addr, tx);
        Ok(Box::new(MemListener {
            addr,
            incoming: Mutex::new(rx),
        }))
    }
}

struct MemListener {
    addr: SocketAddr,
    incoming: Mutex<mpsc::Receiver<Box<dyn OverlayStream>>>,
}

#[async_trait]
impl OverlayListener for MemListener {
    async fn accept(&self) -> OverlayResult<Box<dyn OverlayStream>> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| OverlayError::Net("listener closed".into()))
    }

    fn local_addr(&self) -> OverlayResult<SocketAddr> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memnet_dial_reaches_listener() {
        let net = MemNet::new();
        let addr: SocketAddr = "192.169.99.3:8080".parse().unwrap();

        let listener = net.listen(addr).await.unwrap();
        assert_eq!(listener.local_addr().unwrap(), addr);

        let mut client = net.dial(addr).await.unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        client.write_all(b"hi").await.unwrap();
        client.flush().await.unwrap();

        let mut server = accept.await.unwrap().unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_memnet_dial_without_listener_fails() {
        let net = MemNet::new();
        let addr: SocketAddr = "192.169.99.9:8080".parse().unwrap();
        assert!(net.dial(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_memnet_rejects_double_bind() {
        let net = MemNet::new();
        let addr: SocketAddr = "192.169.99.3:8080".parse().unwrap();
        let _first = net.listen(addr).await.unwrap();
        assert!(net.listen(addr).await.is_err());
    }
}
