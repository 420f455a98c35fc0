//! UDP relay engine.
//!
//! One bound socket accepts datagrams from every client. A session per
//! client address tracks the upstream socket picked by the pool on the
//! first datagram; a per-session reader task carries replies back through
//! the listening socket. A sweeper evicts sessions idle past the limit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{wait_shutdown, BackendPool};
use crate::error::RelayError;

/// Maximum datagram size forwarded in either direction.
const BUFFER_SIZE: usize = 64 * 1024;

/// Sessions with no traffic in either direction for this long are evicted.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How often the sweeper scans the session table.
pub const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Transfer counters for one UDP engine.
#[derive(Debug, Default)]
pub struct UdpStats {
    pub sessions_active: AtomicU64,
    pub dial_failures: AtomicU64,
    pub datagrams_to_upstream: AtomicU64,
    pub datagrams_from_upstream: AtomicU64,
}

struct UdpSession {
    upstream: Arc<UdpSocket>,
    backend: usize,
    last_activity_ms: Arc<AtomicU64>,
    reader: JoinHandle<()>,
}

/// State shared by the receive loop, session readers, and the sweeper.
struct UdpRelay {
    service: String,
    socket: Arc<UdpSocket>,
    pool: Arc<BackendPool>,
    sessions: Mutex<HashMap<SocketAddr, UdpSession>>,
    stats: Arc<UdpStats>,
    epoch: Instant,
}

/// A running UDP relay for one service.
pub struct UdpEngine {
    relay: Arc<UdpRelay>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    recv_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl UdpEngine {
    /// Bind the listening socket and start receiving.
    pub async fn bind(
        service: &str,
        addr: SocketAddr,
        pool: Arc<BackendPool>,
    ) -> Result<Self, RelayError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;

        info!(service, listen_addr = %local_addr, "udp relay listening");

        let relay = Arc::new(UdpRelay {
            service: service.to_string(),
            socket: Arc::new(socket),
            pool,
            sessions: Mutex::new(HashMap::new()),
            stats: Arc::new(UdpStats::default()),
            epoch: Instant::now(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let recv_task = tokio::spawn(Arc::clone(&relay).recv_loop(shutdown_rx.clone()));
        let sweep_task = tokio::spawn(Arc::clone(&relay).sweep_loop(shutdown_rx));

        Ok(Self {
            relay,
            local_addr,
            shutdown,
            recv_task,
            sweep_task,
        })
    }

    /// Address the engine is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &UdpStats {
        &self.relay.stats
    }

    /// Stop receiving and tear down every session. UDP sessions hold no
    /// connection state worth draining, so teardown is immediate.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.recv_task.await;
        let _ = self.sweep_task.await;
        info!(service = %self.relay.service, "udp relay stopped");
    }
}

impl UdpRelay {
    async fn recv_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = wait_shutdown(&mut shutdown) => break,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, client) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!(service = %self.service, error = %e, "udp receive error");
                            continue;
                        }
                    };

                    let upstream = {
                        let table = self.sessions.lock().await;
                        table.get(&client).map(|session| {
                            session
                                .last_activity_ms
                                .store(self.elapsed_ms(), Ordering::Relaxed);
                            Arc::clone(&session.upstream)
                        })
                    };

                    let upstream = match upstream {
                        Some(upstream) => upstream,
                        None => {
                            match Arc::clone(&self).open_session(client, shutdown.clone()).await {
                                Some(upstream) => upstream,
                                // Dial failed: this datagram is dropped.
                                None => continue,
                            }
                        }
                    };

                    match upstream.send(&buf[..len]).await {
                        Ok(_) => {
                            self.stats.datagrams_to_upstream.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(service = %self.service, client = %client, error = %e, "upstream send failed");
                        }
                    }
                }
            }
        }

        // Tear down all sessions on shutdown.
        let mut table = self.sessions.lock().await;
        for (_, session) in table.drain() {
            session.reader.abort();
        }
        self.stats.sessions_active.store(0, Ordering::Relaxed);
    }

    /// Dial an upstream for a new client and register its session.
    async fn open_session(
        self: Arc<Self>,
        client: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Option<Arc<UdpSocket>> {
        let (upstream, backend) = match self.pool.dial_udp().await {
            Ok(dialed) => dialed,
            Err(e) => {
                self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    service = %self.service,
                    client = %client,
                    error = %e,
                    "udp dial failed, dropping datagram"
                );
                return None;
            }
        };

        let upstream = Arc::new(upstream);
        let last_activity_ms = Arc::new(AtomicU64::new(self.elapsed_ms()));

        let reader = tokio::spawn(Arc::clone(&self).session_reader(
            Arc::clone(&upstream),
            client,
            Arc::clone(&last_activity_ms),
            shutdown,
        ));

        let session = UdpSession {
            upstream: Arc::clone(&upstream),
            backend,
            last_activity_ms,
            reader,
        };
        self.sessions.lock().await.insert(client, session);
        self.stats.sessions_active.fetch_add(1, Ordering::Relaxed);
        debug!(service = %self.service, client = %client, backend, "udp session opened");

        Some(upstream)
    }

    /// Forward upstream replies back to the client through the listening
    /// socket.
    async fn session_reader(
        self: Arc<Self>,
        upstream: Arc<UdpSocket>,
        client: SocketAddr,
        last_activity_ms: Arc<AtomicU64>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = wait_shutdown(&mut shutdown) => break,
                received = upstream.recv(&mut buf) => {
                    match received {
                        Ok(len) => {
                            last_activity_ms.store(self.elapsed_ms(), Ordering::Relaxed);
                            self.stats.datagrams_from_upstream.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = self.socket.send_to(&buf[..len], client).await {
                                warn!(service = %self.service, client = %client, error = %e, "reply send failed");
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(service = %self.service, client = %client, error = %e, "upstream socket closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(UDP_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = wait_shutdown(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            let now = self.elapsed_ms();
            let idle_limit = UDP_IDLE_TIMEOUT.as_millis() as u64;

            let mut table = self.sessions.lock().await;
            let before = table.len();
            table.retain(|client, session| {
                let idle = now.saturating_sub(session.last_activity_ms.load(Ordering::Relaxed));
                if idle >= idle_limit {
                    debug!(
                        service = %self.service,
                        client = %client,
                        backend = session.backend,
                        idle_ms = idle,
                        "udp session evicted"
                    );
                    session.reader.abort();
                    false
                } else {
                    true
                }
            });
            let evicted = (before - table.len()) as u64;
            if evicted > 0 {
                self.stats.sessions_active.fetch_sub(evicted, Ordering::Relaxed);
            }
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
