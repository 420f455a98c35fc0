//! Backend pool: ordered failover with per-backend cooldown.
//!
//! Each service owns one pool. The pool yields upstream connections through
//! [`BackendPool::dial`] (TCP) and [`BackendPool::dial_udp`] (UDP), walking
//! its ordered backend list and managing per-backend failure state:
//!
//! - A backend's first failed attempt invalidates its DNS cache entry and is
//!   retried once within the same dial, against freshly resolved addresses.
//! - A second failure moves the backend to the tail of the list and, when a
//!   cooldown is configured, marks it skippable until the cooldown expires.
//! - Backends whose cooldown lies in the future are skipped when building
//!   the candidate list; if that leaves no candidates the full list is used
//!   anyway, since cooldown is a hint and never a hard block.
//! - Any successful dial resets the backend's state.
//!
//! All state lives under one mutex. Resolution and connect attempts happen
//! outside it, so concurrent dials only contend on bookkeeping.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::BackendSpec;
use crate::error::{BackendFailure, RelayError};
use crate::resolver::DnsResolver;

/// Per-address connect deadline.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Failures a backend can accumulate before entering cooldown.
const MAX_STRIKES: u8 = 2;

/// One configured upstream and its failover state.
#[derive(Debug, Clone)]
struct BackendState {
    spec: BackendSpec,
    /// Stable identity: position in the configured list.
    index: usize,
    failures: u8,
    cooldown_until: Option<Instant>,
    last_error: Option<String>,
}

impl BackendState {
    fn new(spec: BackendSpec, index: usize) -> Self {
        Self {
            spec,
            index,
            failures: 0,
            cooldown_until: None,
            last_error: None,
        }
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.map(|until| until > now).unwrap_or(false)
    }

    /// A twice-struck backend whose cooldown window has passed (or was never
    /// opened, with cooldown disabled) starts fresh on its next attempt.
    fn decay(&mut self, now: Instant) {
        if self.failures == MAX_STRIKES && !self.in_cooldown(now) {
            self.failures = 0;
            self.cooldown_until = None;
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.cooldown_until = None;
        self.last_error = None;
    }
}

/// Observational copy of one backend's state.
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub host: String,
    pub port: u16,
    /// Stable identity within the service.
    pub index: usize,
    /// Current position in the failover order.
    pub position: usize,
    pub failures: u8,
    pub cooldown_until: Option<Instant>,
    pub last_error: Option<String>,
}

struct PoolState {
    backends: Vec<BackendState>,
    cooldown: Duration,
}

/// Which strike a recorded failure was.
enum Strike {
    First,
    Second,
}

/// Ordered failover pool for one service.
pub struct BackendPool {
    service: String,
    resolver: Arc<DnsResolver>,
    dial_timeout: Duration,
    state: Mutex<PoolState>,
}

impl BackendPool {
    pub fn new(
        service: impl Into<String>,
        resolver: Arc<DnsResolver>,
        specs: &[BackendSpec],
        cooldown: Duration,
    ) -> Self {
        Self::with_dial_timeout(service, resolver, specs, cooldown, DEFAULT_DIAL_TIMEOUT)
    }

    pub fn with_dial_timeout(
        service: impl Into<String>,
        resolver: Arc<DnsResolver>,
        specs: &[BackendSpec],
        cooldown: Duration,
        dial_timeout: Duration,
    ) -> Self {
        let backends = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| BackendState::new(spec.clone(), index))
            .collect();
        Self {
            service: service.into(),
            resolver,
            dial_timeout,
            state: Mutex::new(PoolState { backends, cooldown }),
        }
    }

    /// Connect to the first reachable backend over TCP.
    ///
    /// Returns the open stream and the backend's stable index.
    pub async fn dial(&self) -> Result<(TcpStream, usize), RelayError> {
        let mut failures = Vec::new();

        for (index, spec) in self.candidates().await {
            loop {
                match self.connect_tcp(&spec).await {
                    Ok(stream) => {
                        self.on_success(index).await;
                        return Ok((stream, index));
                    }
                    Err(error) => match self.note_failure(index, &spec, &error, &mut failures).await
                    {
                        NextStep::RetrySame => continue,
                        NextStep::MoveOn => break,
                    },
                }
            }
        }

        Err(RelayError::AllBackendsFailed { failures })
    }

    /// UDP variant of [`dial`](Self::dial): returns a socket connected to one
    /// resolved address of the first eligible backend.
    ///
    /// Without a connect handshake, failure here means DNS resolution or
    /// socket setup failed; the strike accounting is shared with TCP.
    pub async fn dial_udp(&self) -> Result<(UdpSocket, usize), RelayError> {
        let mut failures = Vec::new();

        for (index, spec) in self.candidates().await {
            loop {
                match self.connect_udp(&spec).await {
                    Ok(socket) => {
                        self.on_success(index).await;
                        return Ok((socket, index));
                    }
                    Err(error) => match self.note_failure(index, &spec, &error, &mut failures).await
                    {
                        NextStep::RetrySame => continue,
                        NextStep::MoveOn => break,
                    },
                }
            }
        }

        Err(RelayError::AllBackendsFailed { failures })
    }

    /// Reset a backend's failover state after a successful dial.
    pub async fn on_success(&self, index: usize) {
        let mut state = self.state.lock().await;
        if let Some(backend) = state.backends.iter_mut().find(|b| b.index == index) {
            backend.reset();
        }
    }

    /// Replace the backend list from a new snapshot, preserving failover
    /// state for backends that survive (identity: host + port). The new
    /// configured order becomes the failover order.
    pub async fn replace_backends(&self, specs: &[BackendSpec]) {
        let mut state = self.state.lock().await;
        let old = std::mem::take(&mut state.backends);
        state.backends = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| match old.iter().find(|b| &b.spec == spec) {
                Some(prev) => BackendState {
                    spec: spec.clone(),
                    index,
                    failures: prev.failures,
                    cooldown_until: prev.cooldown_until,
                    last_error: prev.last_error.clone(),
                },
                None => BackendState::new(spec.clone(), index),
            })
            .collect();
        debug!(
            service = %self.service,
            backend_count = state.backends.len(),
            "backend list replaced"
        );
    }

    /// Update the cooldown duration. Deadlines already in flight stand as
    /// previously computed.
    pub async fn set_cooldown(&self, cooldown: Duration) {
        self.state.lock().await.cooldown = cooldown;
    }

    /// Copy out the current state of every backend, in failover order.
    pub async fn snapshot(&self) -> Vec<BackendSnapshot> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        for backend in &mut state.backends {
            backend.decay(now);
        }
        state
            .backends
            .iter()
            .enumerate()
            .map(|(position, b)| BackendSnapshot {
                host: b.spec.host.clone(),
                port: b.spec.port,
                index: b.index,
                position,
                failures: b.failures,
                cooldown_until: b.cooldown_until,
                last_error: b.last_error.clone(),
            })
            .collect()
    }

    /// Candidate order for one dial: the current list minus backends in
    /// cooldown, or the full list when everything is cooling.
    async fn candidates(&self) -> Vec<(usize, BackendSpec)> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        for backend in &mut state.backends {
            backend.decay(now);
        }

        let warm: Vec<_> = state
            .backends
            .iter()
            .filter(|b| !b.in_cooldown(now))
            .map(|b| (b.index, b.spec.clone()))
            .collect();
        if !warm.is_empty() {
            return warm;
        }
        state
            .backends
            .iter()
            .map(|b| (b.index, b.spec.clone()))
            .collect()
    }

    /// Record a failed attempt and decide what the dial does next: retry the
    /// same backend with fresh DNS (first strike) or move on (second).
    async fn note_failure(
        &self,
        index: usize,
        spec: &BackendSpec,
        error: &RelayError,
        failures: &mut Vec<BackendFailure>,
    ) -> NextStep {
        let message = error.to_string();
        match self.record_failure(index, &message).await {
            Strike::First => {
                debug!(
                    service = %self.service,
                    backend = %spec,
                    error = %message,
                    "dial attempt failed, refreshing dns for retry"
                );
                self.resolver.invalidate(&spec.host).await;
                NextStep::RetrySame
            }
            Strike::Second => {
                failures.push(BackendFailure {
                    backend: index,
                    error: message,
                });
                NextStep::MoveOn
            }
        }
    }

    async fn record_failure(&self, index: usize, error: &str) -> Strike {
        let mut state = self.state.lock().await;
        let cooldown = state.cooldown;
        let Some(position) = state.backends.iter().position(|b| b.index == index) else {
            // The backend was removed by a concurrent reconfiguration.
            return Strike::Second;
        };

        let backend = &mut state.backends[position];
        backend.last_error = Some(error.to_string());
        if backend.failures == 0 {
            backend.failures = 1;
            return Strike::First;
        }

        backend.failures = MAX_STRIKES;
        if !cooldown.is_zero() {
            backend.cooldown_until = Some(Instant::now() + cooldown);
        }
        let backend = state.backends.remove(position);
        warn!(
            service = %self.service,
            backend = %backend.spec,
            cooldown_secs = cooldown.as_secs(),
            error,
            "backend entered cooldown, rotated to tail"
        );
        state.backends.push(backend);
        Strike::Second
    }

    async fn connect_tcp(&self, spec: &BackendSpec) -> Result<TcpStream, RelayError> {
        let addrs = self.resolver.resolve(&spec.host).await?;

        let mut last: Option<io::Error> = None;
        for &addr in addrs.iter() {
            let target = SocketAddr::new(addr, spec.port);
            match timeout(self.dial_timeout, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => {
                    debug!(service = %self.service, backend = %spec, addr = %target, "connected");
                    return Ok(stream);
                }
                Ok(Err(error)) => last = Some(error),
                Err(_) => {
                    last = Some(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
                }
            }
        }

        Err(RelayError::Dial {
            backend: spec.to_string(),
            source: last
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses")),
        })
    }

    async fn connect_udp(&self, spec: &BackendSpec) -> Result<UdpSocket, RelayError> {
        let addrs = self.resolver.resolve(&spec.host).await?;

        let mut last: Option<io::Error> = None;
        for &addr in addrs.iter() {
            let target = SocketAddr::new(addr, spec.port);
            let local: SocketAddr = match target {
                SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            };
            let socket = match UdpSocket::bind(local).await {
                Ok(socket) => socket,
                Err(error) => {
                    last = Some(error);
                    continue;
                }
            };
            match socket.connect(target).await {
                Ok(()) => return Ok(socket),
                Err(error) => last = Some(error),
            }
        }

        Err(RelayError::Dial {
            backend: spec.to_string(),
            source: last
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses")),
        })
    }
}

enum NextStep {
    RetrySame,
    MoveOn,
}
