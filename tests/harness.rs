//! Shared helpers for relay integration tests.
//!
//! Provides echo backends for TCP and UDP, dead-port reservation, and small
//! constructors for pools and service configs bound to ephemeral ports.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::time::timeout;

use relayd::config::{BackendSpec, ListenConfig, Protocol, ServiceConfig};
use relayd::relay::BackendPool;
use relayd::resolver::DnsResolver;

/// A TCP backend that echoes everything it reads.
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_on(TcpListener::bind("127.0.0.1:0").await?).await
    }

    /// Bring a backend up on a specific address, e.g. one reserved with
    /// [`dead_addr`] to simulate recovery.
    pub async fn spawn_at(addr: SocketAddr) -> io::Result<Self> {
        Self::spawn_on(TcpListener::bind(addr).await?).await
    }

    async fn spawn_on(listener: TcpListener) -> io::Result<Self> {
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A UDP backend that echoes every datagram back to its sender.
pub struct UdpEchoBackend {
    pub addr: SocketAddr,
    pub datagrams: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl UdpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let datagrams = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let count_clone = Arc::clone(&datagrams);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        match received {
                            Ok((n, from)) => {
                                count_clone.fetch_add(1, Ordering::Relaxed);
                                let _ = socket.send_to(&buf[..n], from).await;
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            datagrams,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn datagram_count(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }
}

impl Drop for UdpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Reserve a local port with nothing listening on it.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn backend(addr: SocketAddr) -> BackendSpec {
    BackendSpec {
        host: addr.ip().to_string(),
        port: addr.port(),
    }
}

pub fn pool_for(backends: &[SocketAddr], cooldown: Duration) -> Arc<BackendPool> {
    let specs: Vec<BackendSpec> = backends.iter().copied().map(backend).collect();
    Arc::new(BackendPool::new(
        "test",
        Arc::new(DnsResolver::new()),
        &specs,
        cooldown,
    ))
}

/// A service bound to an ephemeral local port.
pub fn service(name: &str, protocol: Protocol, backends: &[BackendSpec]) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        protocol,
        listen: ListenConfig {
            address: "127.0.0.1".parse().unwrap(),
            port: 0,
        },
        backends: backends.to_vec(),
        backend_cooldown: 60,
    }
}

/// Connect, send a payload, and read the echoed response.
pub async fn tcp_roundtrip(addr: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, &'static str> {
    let result = timeout(Duration::from_millis(1500), async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(payload).await?;
        stream.flush().await?;
        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await?;
        Ok::<_, io::Error>(buf[..n].to_vec())
    })
    .await;

    match result {
        Ok(Ok(data)) if !data.is_empty() => Ok(data),
        Ok(Ok(_)) => Err("connection closed"),
        Ok(Err(_)) => Err("io error"),
        Err(_) => Err("timeout"),
    }
}

/// Send a datagram and wait for the relayed reply.
pub async fn udp_roundtrip(addr: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, &'static str> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.map_err(|_| "bind")?;
    socket.send_to(payload, addr).await.map_err(|_| "send")?;

    let mut buf = vec![0u8; 256];
    match timeout(Duration::from_millis(1500), socket.recv_from(&mut buf)).await {
        Ok(Ok((n, _))) => Ok(buf[..n].to_vec()),
        Ok(Err(_)) => Err("io error"),
        Err(_) => Err("timeout"),
    }
}
