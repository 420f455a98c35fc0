//! DNS resolution with a time-bounded cache.
//!
//! Hosts resolve through the system resolver (`tokio::net::lookup_host`);
//! results are cached for a fixed TTL so the hot dial path performs no
//! network I/O. IP literals bypass the cache entirely. Concurrent misses for
//! the same host are deduplicated: one caller performs the system lookup,
//! the rest wait on it and share its result.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::lookup_host;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::error::ResolveError;
use crate::relay::wait_shutdown;

/// How long a cached resolution stays valid.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Deadline for a single system resolution.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved address set, shared between the cache and its readers.
pub type ResolvedAddrs = Arc<Vec<IpAddr>>;

type InflightResult = Option<Result<ResolvedAddrs, ResolveError>>;

struct CacheEntry {
    addrs: ResolvedAddrs,
    expires_at: Instant,
}

/// Caching resolver. One instance per process.
pub struct DnsResolver {
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, watch::Receiver<InflightResult>>>,
}

impl DnsResolver {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a host to a non-empty ordered address list.
    ///
    /// Literals (IPv4, IPv6, and the bracketed IPv6 form that appears inside
    /// `host:port` strings) return immediately without touching the cache.
    pub async fn resolve(&self, host: &str) -> Result<ResolvedAddrs, ResolveError> {
        if let Some(ip) = parse_literal(host) {
            return Ok(Arc::new(vec![ip]));
        }

        loop {
            if let Some(addrs) = self.cached(host).await {
                return Ok(addrs);
            }

            enum Role {
                Leader(watch::Sender<InflightResult>),
                Follower(watch::Receiver<InflightResult>),
            }

            let role = {
                let mut inflight = self.inflight.lock().await;
                match inflight.get(host) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(host.to_string(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    // The cache may have been filled between our miss and
                    // taking leadership.
                    let result = match self.cached(host).await {
                        Some(addrs) => Ok(addrs),
                        None => {
                            let result = self.lookup(host).await;
                            if let Ok(addrs) = &result {
                                let mut cache = self.cache.lock().await;
                                cache.insert(
                                    host.to_string(),
                                    CacheEntry {
                                        addrs: addrs.clone(),
                                        expires_at: Instant::now() + self.ttl,
                                    },
                                );
                            }
                            result
                        }
                    };
                    self.inflight.lock().await.remove(host);
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
                Role::Follower(mut rx) => loop {
                    let published = rx.borrow_and_update().clone();
                    if let Some(result) = published {
                        return result;
                    }
                    if rx.changed().await.is_err() {
                        // Leader dropped without publishing; clear the stale
                        // entry and start over.
                        let mut inflight = self.inflight.lock().await;
                        if let Some(existing) = inflight.get(host) {
                            if existing.same_channel(&rx) {
                                inflight.remove(host);
                            }
                        }
                        break;
                    }
                },
            }
        }
    }

    /// Drop any cache entry for the host. Idempotent.
    pub async fn invalidate(&self, host: &str) {
        if self.cache.lock().await.remove(host).is_some() {
            debug!(host, "dns cache entry invalidated");
        }
    }

    /// Re-resolve every cached host. Best-effort: a failed refresh keeps the
    /// previous addresses unless the entry has already expired.
    pub async fn refresh_all(&self) {
        let hosts: Vec<String> = self.cache.lock().await.keys().cloned().collect();
        for host in hosts {
            match self.lookup(&host).await {
                Ok(addrs) => {
                    let mut cache = self.cache.lock().await;
                    cache.insert(
                        host,
                        CacheEntry {
                            addrs,
                            expires_at: Instant::now() + self.ttl,
                        },
                    );
                }
                Err(error) => {
                    warn!(host = %host, error = %error, "dns refresh failed");
                    let mut cache = self.cache.lock().await;
                    let expired = cache
                        .get(&host)
                        .map(|entry| entry.expires_at <= Instant::now())
                        .unwrap_or(false);
                    if expired {
                        cache.remove(&host);
                    }
                }
            }
        }
    }

    /// Periodic refresher. Runs until the shutdown flag flips or its sender
    /// is dropped.
    pub async fn run_refresher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ttl.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh_all().await,
                _ = wait_shutdown(&mut shutdown) => break,
            }
        }
    }

    async fn cached(&self, host: &str) -> Option<ResolvedAddrs> {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.get(host) {
            if entry.expires_at > Instant::now() {
                return Some(entry.addrs.clone());
            }
        }
        cache.remove(host);
        None
    }

    async fn lookup(&self, host: &str) -> Result<ResolvedAddrs, ResolveError> {
        let resolved = match tokio::time::timeout(LOOKUP_TIMEOUT, lookup_host((host, 0u16))).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(error)) => return Err(ResolveError::new(host, error.to_string())),
            Err(_) => return Err(ResolveError::new(host, "resolution timed out")),
        };

        let mut addrs: Vec<IpAddr> = Vec::new();
        for addr in resolved {
            if !addrs.contains(&addr.ip()) {
                addrs.push(addr.ip());
            }
        }
        if addrs.is_empty() {
            return Err(ResolveError::new(host, "no addresses returned"));
        }
        debug!(host, count = addrs.len(), "host resolved");
        Ok(Arc::new(addrs))
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_literal(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    host.strip_prefix('[')?
        .strip_suffix(']')?
        .parse::<Ipv6Addr>()
        .ok()
        .map(IpAddr::V6)
}
