//! TCP relay engine.
//!
//! One engine per (service, TCP). Accepts clients, dials an upstream through
//! the shared backend pool, and splices bytes in both directions until EOF,
//! error, idle timeout, or engine stop.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{wait_shutdown, BackendPool};
use crate::error::RelayError;

/// Copy buffer size per direction.
const BUFFER_SIZE: usize = 64 * 1024;

/// Sessions with no transfer in either direction for this long are closed.
pub const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Transfer counters for one TCP engine.
#[derive(Debug, Default)]
pub struct TcpStats {
    pub connections_accepted: AtomicU64,
    pub sessions_active: AtomicU64,
    pub dial_failures: AtomicU64,
    pub bytes_to_upstream: AtomicU64,
    pub bytes_from_upstream: AtomicU64,
}

/// A running TCP relay for one service.
#[derive(Debug)]
pub struct TcpEngine {
    service: String,
    local_addr: SocketAddr,
    stats: Arc<TcpStats>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    drain_rx: mpsc::Receiver<()>,
}

impl TcpEngine {
    /// Bind the listener and start accepting.
    pub async fn bind(
        service: &str,
        addr: SocketAddr,
        pool: Arc<BackendPool>,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let stats = Arc::new(TcpStats::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = mpsc::channel(1);

        info!(service, listen_addr = %local_addr, "tcp relay listening");

        let accept_task = tokio::spawn(accept_loop(
            service.to_string(),
            listener,
            pool,
            Arc::clone(&stats),
            shutdown_rx,
            drain_tx,
        ));

        Ok(Self {
            service: service.to_string(),
            local_addr,
            stats,
            shutdown,
            accept_task,
            drain_rx,
        })
    }

    /// Address the engine is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &TcpStats {
        &self.stats
    }

    /// Stop accepting, signal every open session, and wait up to `grace`
    /// for them to terminate.
    pub async fn stop(mut self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let _ = self.accept_task.await;

        // Each session task holds a clone of the drain sender; recv resolves
        // once the last one is dropped.
        if tokio::time::timeout(grace, self.drain_rx.recv())
            .await
            .is_err()
        {
            warn!(service = %self.service, "tcp sessions did not drain within grace period");
        }
        info!(service = %self.service, "tcp relay stopped");
    }
}

async fn accept_loop(
    service: String,
    listener: TcpListener,
    pool: Arc<BackendPool>,
    stats: Arc<TcpStats>,
    mut shutdown: watch::Receiver<bool>,
    drain: mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((client, peer)) => {
                        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        let service = service.clone();
                        let pool = Arc::clone(&pool);
                        let stats = Arc::clone(&stats);
                        let shutdown = shutdown.clone();
                        let drain = drain.clone();
                        tokio::spawn(async move {
                            stats.sessions_active.fetch_add(1, Ordering::Relaxed);
                            handle_client(&service, client, peer, pool, &stats, shutdown).await;
                            stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
                            drop(drain);
                        });
                    }
                    Err(e) => {
                        error!(service = %service, error = %e, "accept error");
                        // Avoid a tight loop on persistent accept failures.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

async fn handle_client(
    service: &str,
    mut client: TcpStream,
    peer: SocketAddr,
    pool: Arc<BackendPool>,
    stats: &TcpStats,
    shutdown: watch::Receiver<bool>,
) {
    let (mut upstream, backend) = match pool.dial().await {
        Ok(dialed) => dialed,
        Err(e) => {
            stats.dial_failures.fetch_add(1, Ordering::Relaxed);
            warn!(service, peer = %peer, error = %e, "no upstream for client, closing");
            return;
        }
    };

    debug!(service, peer = %peer, backend, "session open");

    match splice(&mut client, &mut upstream, stats, shutdown).await {
        Ok((to_upstream, from_upstream)) => {
            debug!(
                service,
                peer = %peer,
                backend,
                bytes_to_upstream = to_upstream,
                bytes_from_upstream = from_upstream,
                "session closed"
            );
        }
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
            debug!(service, peer = %peer, backend, "session idle, closing");
        }
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {
            debug!(service, peer = %peer, backend, "session closed by engine stop");
        }
        Err(e) => {
            // Errors on an established session never feed the pool's failure
            // accounting; that is strictly about dialing.
            warn!(service, peer = %peer, backend, error = %e, "session io error");
        }
    }
}

/// Copy bytes in both directions until EOF on both, an error, the shared
/// idle deadline, or engine shutdown. Returns (client->upstream,
/// upstream->client) byte counts.
async fn splice(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    stats: &TcpStats,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<(u64, u64)> {
    let epoch = Instant::now();
    let activity = AtomicU64::new(0);

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let to_upstream = copy_direction(
        &mut client_read,
        &mut upstream_write,
        &activity,
        epoch,
        &stats.bytes_to_upstream,
    );
    let from_upstream = copy_direction(
        &mut upstream_read,
        &mut client_write,
        &activity,
        epoch,
        &stats.bytes_from_upstream,
    );

    tokio::select! {
        results = async { tokio::join!(to_upstream, from_upstream) } => {
            match results {
                (Ok(sent), Ok(received)) => Ok((sent, received)),
                (Err(e), _) | (_, Err(e)) => Err(e),
            }
        }
        _ = wait_shutdown(&mut shutdown) => {
            Err(io::Error::new(io::ErrorKind::Interrupted, "engine stopping"))
        }
    }
}

/// One direction of a session. On EOF the peer's write side is shut down so
/// half-close propagates; the idle deadline is shared with the other
/// direction through `activity`.
async fn copy_direction<R, W>(
    read: &mut R,
    write: &mut W,
    activity: &AtomicU64,
    epoch: Instant,
    counter: &AtomicU64,
) -> io::Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let idle_for = elapsed_ms(epoch).saturating_sub(activity.load(Ordering::Relaxed));
        let Some(remaining) = TCP_IDLE_TIMEOUT.checked_sub(Duration::from_millis(idle_for)) else {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "session idle"));
        };

        match tokio::time::timeout(remaining, read.read(&mut buf)).await {
            // Deadline reached; the other direction may have been active in
            // the meantime, so re-derive the deadline from the shared stamp.
            Err(_) => continue,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                activity.store(elapsed_ms(epoch), Ordering::Relaxed);
                write.write_all(&buf[..n]).await?;
                counter.fetch_add(n as u64, Ordering::Relaxed);
                total += n as u64;
            }
            Ok(Err(e)) => return Err(e),
        }
    }

    write.shutdown().await?;
    Ok(total)
}

fn elapsed_ms(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendSpec;
    use crate::resolver::DnsResolver;

    #[tokio::test]
    async fn bind_error_is_reported() {
        let resolver = Arc::new(DnsResolver::new());
        let specs = vec![BackendSpec {
            host: "127.0.0.1".to_string(),
            port: 9,
        }];
        let pool = Arc::new(BackendPool::new(
            "test",
            resolver,
            &specs,
            Duration::from_secs(60),
        ));

        let first = TcpEngine::bind("test", "127.0.0.1:0".parse().unwrap(), Arc::clone(&pool))
            .await
            .unwrap();
        let taken = first.local_addr();

        let err = TcpEngine::bind("test", taken, pool).await.unwrap_err();
        assert!(matches!(err, RelayError::Bind { .. }));

        first.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn stats_start_at_zero() {
        let stats = TcpStats::default();
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 0);
        assert_eq!(stats.sessions_active.load(Ordering::Relaxed), 0);
    }
}
