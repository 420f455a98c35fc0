//! Service lifecycle and configuration reconciliation.
//!
//! The [`ServiceManager`] owns the running services and converges them to
//! whatever the latest configuration snapshot asks for: services are started
//! when they appear, stopped when they disappear, and mutated in place where
//! possible so that reconfiguration does not disturb traffic on services
//! that did not change.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{RelayConfig, ServiceConfig};
use crate::error::RelayError;
use crate::relay::{BackendPool, BackendSnapshot, TcpEngine, UdpEngine};
use crate::resolver::DnsResolver;

/// How long stopped TCP services may drain open sessions.
const TCP_STOP_GRACE: Duration = Duration::from_secs(5);

/// One running service.
struct ServiceRecord {
    config: ServiceConfig,
    pool: Arc<BackendPool>,
    tcp: Option<TcpEngine>,
    udp: Option<UdpEngine>,
}

/// What one `apply` call did, by service name.
#[derive(Debug, Default)]
pub struct ApplySummary {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    /// Services that could not be brought up, with the error.
    pub failed: Vec<(String, String)>,
}

/// Observational view of one running service.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub name: String,
    /// Actual TCP listen address, once bound.
    pub tcp_listen: Option<std::net::SocketAddr>,
    /// Actual UDP listen address, once bound.
    pub udp_listen: Option<std::net::SocketAddr>,
    pub backends: Vec<BackendSnapshot>,
    pub tcp_sessions: u64,
    pub udp_sessions: u64,
}

/// Owns the running services and the resolver's refresher. One per process.
pub struct ServiceManager {
    resolver: Arc<DnsResolver>,
    services: Mutex<HashMap<String, ServiceRecord>>,
    refresher_shutdown: watch::Sender<bool>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceManager {
    pub fn new(resolver: Arc<DnsResolver>) -> Self {
        let (refresher_shutdown, shutdown_rx) = watch::channel(false);
        let refresher = tokio::spawn(Arc::clone(&resolver).run_refresher(shutdown_rx));
        Self {
            resolver,
            services: Mutex::new(HashMap::new()),
            refresher_shutdown,
            refresher: Mutex::new(Some(refresher)),
        }
    }

    /// Reconcile the running services with a configuration snapshot.
    ///
    /// Apply calls are serialized; snapshots arrive from one producer at a
    /// time. A service that fails to come up degrades only itself.
    pub async fn apply(&self, config: &RelayConfig) -> ApplySummary {
        let mut services = self.services.lock().await;
        let mut summary = ApplySummary::default();

        // Stop services absent from the snapshot.
        let removed: Vec<String> = services
            .keys()
            .filter(|name| !config.services.iter().any(|s| &s.name == *name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(record) = services.remove(&name) {
                stop_record(record).await;
                info!(service = %name, "service stopped");
                summary.stopped.push(name);
            }
        }

        for desired in &config.services {
            let name = desired.name.clone();
            let Some(mut record) = services.remove(&name) else {
                // New service.
                match self.start_service(desired).await {
                    Ok(record) => {
                        services.insert(name.clone(), record);
                        info!(service = %name, listen = %desired.listen, "service started");
                        summary.started.push(name);
                    }
                    Err(e) => {
                        error!(service = %name, error = %e, "service failed to start");
                        summary.failed.push((name, e.to_string()));
                    }
                }
                continue;
            };

            if record.config == *desired {
                services.insert(name.clone(), record);
                summary.unchanged.push(name);
                continue;
            }

            let listen_changed = record.config.listen != desired.listen;
            let protocol_changed = record.config.protocol != desired.protocol;
            if listen_changed {
                // The endpoint moved: bind the new one first so a failure
                // retains the previous listener.
                match self.start_service(desired).await {
                    Ok(new_record) => {
                        stop_record(record).await;
                        services.insert(name.clone(), new_record);
                        info!(service = %name, listen = %desired.listen, "service restarted");
                        summary.updated.push(name);
                    }
                    Err(e) => {
                        warn!(
                            service = %name,
                            error = %e,
                            "restart failed, retaining previous listener"
                        );
                        services.insert(name.clone(), record);
                        summary.failed.push((name, e.to_string()));
                    }
                }
                continue;
            }
            if protocol_changed {
                // Same endpoint, different transports: the old listener must
                // go before the new one can bind.
                stop_record(record).await;
                match self.start_service(desired).await {
                    Ok(new_record) => {
                        services.insert(name.clone(), new_record);
                        info!(service = %name, "service restarted");
                        summary.updated.push(name);
                    }
                    Err(e) => {
                        error!(service = %name, error = %e, "service failed to restart");
                        summary.failed.push((name, e.to_string()));
                    }
                }
                continue;
            }

            // In-place mutation: traffic keeps flowing.
            if record.config.backends != desired.backends {
                record.pool.replace_backends(&desired.backends).await;
            }
            if record.config.backend_cooldown != desired.backend_cooldown {
                record.pool.set_cooldown(desired.cooldown()).await;
            }
            record.config = desired.clone();
            services.insert(name.clone(), record);
            info!(service = %name, "service updated in place");
            summary.updated.push(name);
        }

        summary
    }

    /// Copy out the state of every running service, sorted by name.
    pub async fn status(&self) -> Vec<ServiceStatus> {
        let services = self.services.lock().await;
        let mut statuses = Vec::with_capacity(services.len());
        for (name, record) in services.iter() {
            statuses.push(ServiceStatus {
                name: name.clone(),
                tcp_listen: record.tcp.as_ref().map(|e| e.local_addr()),
                udp_listen: record.udp.as_ref().map(|e| e.local_addr()),
                backends: record.pool.snapshot().await,
                tcp_sessions: record
                    .tcp
                    .as_ref()
                    .map(|e| e.stats().sessions_active.load(Ordering::Relaxed))
                    .unwrap_or(0),
                udp_sessions: record
                    .udp
                    .as_ref()
                    .map(|e| e.stats().sessions_active.load(Ordering::Relaxed))
                    .unwrap_or(0),
            });
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Stop everything: services, then the DNS refresher.
    pub async fn shutdown(&self) {
        self.apply(&RelayConfig::empty()).await;
        let _ = self.refresher_shutdown.send(true);
        if let Some(handle) = self.refresher.lock().await.take() {
            let _ = handle.await;
        }
        info!("relay shut down");
    }

    async fn start_service(&self, config: &ServiceConfig) -> Result<ServiceRecord, RelayError> {
        let pool = Arc::new(BackendPool::new(
            &config.name,
            Arc::clone(&self.resolver),
            &config.backends,
            config.cooldown(),
        ));
        let listen = config.listen.socket_addr();

        let tcp = if config.protocol.tcp() {
            Some(TcpEngine::bind(&config.name, listen, Arc::clone(&pool)).await?)
        } else {
            None
        };

        let udp = if config.protocol.udp() {
            match UdpEngine::bind(&config.name, listen, Arc::clone(&pool)).await {
                Ok(engine) => Some(engine),
                Err(e) => {
                    // Don't leak the TCP listener on a partial failure.
                    if let Some(tcp) = tcp {
                        tcp.stop(Duration::ZERO).await;
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(ServiceRecord {
            config: config.clone(),
            pool,
            tcp,
            udp,
        })
    }
}

async fn stop_record(record: ServiceRecord) {
    if let Some(tcp) = record.tcp {
        tcp.stop(TCP_STOP_GRACE).await;
    }
    if let Some(udp) = record.udp {
        udp.stop().await;
    }
}
