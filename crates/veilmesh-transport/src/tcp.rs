//! Length-framed TCP transport.
//!
//! The connection-oriented alternative backend: each datagram is sent as
//! `[len: u32 BE][bytes]` over a per-peer TCP connection. Connections are
//! dialed lazily on first send and cached; inbound connections are
//! accepted by a background task and feed the same receive queue, so the
//! router sees the exact datagram semantics it gets from UDP.

use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Largest frame accepted over a stream connection.
const MAX_FRAME: usize = 1 << 20;

/// Depth of the inbound datagram queue shared by all connections.
const INBOUND_QUEUE: usize = 1024;

struct Shared {
    closed: AtomicBool,
    writers: DashMap<SocketAddr, Arc<Mutex<OwnedWriteHalf>>>,
    inbound_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

/// TCP transport presenting datagram semantics over framed streams.
pub struct TcpTransport {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    inbound_rx: Mutex<mpsc::Receiver<(Vec<u8>, SocketAddr)>>,
    accept_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind a listening TCP transport to the given address.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::BindFailed` if binding fails.
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr.into())
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            writers: DashMap::new(),
            inbound_tx,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            recv_errors: AtomicU64::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            loop {
                if accept_shared.closed.load(Ordering::Relaxed) {
                    break;
                }
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Accepted stream connection from {peer}");
                        register_connection(&accept_shared, stream, peer);
                    }
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            shared,
            inbound_rx: Mutex::new(inbound_rx),
            accept_task: std::sync::Mutex::new(Some(accept_task)),
        })
    }

    async fn writer_for(&self, addr: SocketAddr) -> TransportResult<Arc<Mutex<OwnedWriteHalf>>> {
        if let Some(writer) = self.shared.writers.get(&addr) {
            return Ok(Arc::clone(writer.value()));
        }

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        Ok(register_connection(&self.shared, stream, addr))
    }
}

/// Split a connection, cache its write half and spawn its read loop.
fn register_connection(
    shared: &Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Arc<Mutex<OwnedWriteHalf>> {
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));
    shared.writers.insert(peer, Arc::clone(&writer));

    let read_shared = Arc::clone(shared);
    tokio::spawn(async move {
        if let Err(e) = read_loop(&read_shared, read_half, peer).await {
            debug!("Stream from {peer} ended: {e}");
        }
        read_shared.writers.remove(&peer);
    });

    writer
}

async fn read_loop(
    shared: &Shared,
    mut read_half: OwnedReadHalf,
    peer: SocketAddr,
) -> TransportResult<()> {
    loop {
        if shared.closed.load(Ordering::Relaxed) {
            return Ok(());
        }

        let len = read_half.read_u32().await? as usize;
        if len > MAX_FRAME {
            shared.recv_errors.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::OversizedFrame(len));
        }

        let mut frame = vec![0u8; len];
        read_half.read_exact(&mut frame).await?;

        shared
            .bytes_received
            .fetch_add(len as u64, Ordering::Relaxed);
        shared.packets_received.fetch_add(1, Ordering::Relaxed);

        if shared.inbound_tx.send((frame, peer)).await.is_err() {
            // Receiver side was dropped; transport is shutting down.
            return Ok(());
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if buf.len() > MAX_FRAME {
            return Err(TransportError::OversizedFrame(buf.len()));
        }

        let writer = self.writer_for(addr).await?;
        let mut guard = writer.lock().await;

        let result: std::io::Result<()> = async {
            guard.write_u32(buf.len() as u32).await?;
            guard.write_all(buf).await?;
            guard.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                self.shared
                    .bytes_sent
                    .fetch_add(buf.len() as u64, Ordering::Relaxed);
                self.shared.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(buf.len())
            }
            Err(e) => {
                // A broken connection is forgotten so the next send redials.
                self.shared.writers.remove(&addr);
                self.shared.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let mut rx = self.inbound_rx.lock().await;
        let (frame, peer) = rx.recv().await.ok_or(TransportError::Closed)?;

        if frame.len() > buf.len() {
            return Err(TransportError::OversizedFrame(frame.len()));
        }
        buf[..frame.len()].copy_from_slice(&frame);
        Ok((frame.len(), peer))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn close(&self) -> TransportResult<()> {
        self.shared.closed.store(true, Ordering::Relaxed);
        if let Some(task) = self.accept_task.lock().expect("lock poisoned").take() {
            task.abort();
        }
        self.shared.writers.clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.shared.packets_sent.load(Ordering::Relaxed),
            packets_received: self.shared.packets_received.load(Ordering::Relaxed),
            send_errors: self.shared.send_errors.load(Ordering::Relaxed),
            recv_errors: self.shared.recv_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn any_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_tcp_bind() {
        let transport = TcpTransport::bind(any_addr()).await.unwrap();
        assert_ne!(transport.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_tcp_send_recv() {
        let server = TcpTransport::bind(any_addr()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = TcpTransport::bind(any_addr()).await.unwrap();

        let sent = client.send_to(b"framed datagram", server_addr).await.unwrap();
        assert_eq!(sent, 15);

        let mut buf = vec![0u8; 1500];
        let (size, _from) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(&buf[..size], b"framed datagram");
    }

    #[tokio::test]
    async fn test_tcp_reply_over_same_connection() {
        let server = TcpTransport::bind(any_addr()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = TcpTransport::bind(any_addr()).await.unwrap();

        client.send_to(b"ping", server_addr).await.unwrap();

        let mut buf = vec![0u8; 64];
        let (_, from) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();

        // The server replies to the observed (ephemeral) address; the
        // cached connection carries it back.
        server.send_to(b"pong", from).await.unwrap();

        let (size, _) = timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(&buf[..size], b"pong");
    }

    #[tokio::test]
    async fn test_tcp_multiple_frames_preserve_boundaries() {
        let server = TcpTransport::bind(any_addr()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = TcpTransport::bind(any_addr()).await.unwrap();

        for i in 0u8..5 {
            client.send_to(&[i; 10], server_addr).await.unwrap();
        }

        let mut buf = vec![0u8; 64];
        for i in 0u8..5 {
            let (size, _) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
                .await
                .expect("Timeout")
                .unwrap();
            assert_eq!(size, 10);
            assert_eq!(&buf[..size], &[i; 10]);
        }
    }

    #[tokio::test]
    async fn test_tcp_oversized_send_rejected() {
        let transport = TcpTransport::bind(any_addr()).await.unwrap();
        let big = vec![0u8; MAX_FRAME + 1];
        let result = transport
            .send_to(&big, "127.0.0.1:1".parse().unwrap())
            .await;
        assert!(matches!(result, Err(TransportError::OversizedFrame(_))));
    }

    #[tokio::test]
    async fn test_tcp_close() {
        let transport = TcpTransport::bind(any_addr()).await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_closed());

        let result = transport
            .send_to(b"x", "127.0.0.1:1234".parse().unwrap())
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_tcp_connection_refused() {
        let client = TcpTransport::bind(any_addr()).await.unwrap();
        // Nothing listens on the server side.
        let result = client
            .send_to(b"x", "127.0.0.1:9".parse().unwrap())
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
