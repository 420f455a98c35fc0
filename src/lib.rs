pub mod config;
pub mod error;
pub mod manager;
pub mod relay;
pub mod resolver;

pub use config::{BackendSpec, ListenConfig, Protocol, RelayConfig, ServiceConfig};
pub use error::{BackendFailure, RelayError, ResolveError};
pub use manager::{ApplySummary, ServiceManager, ServiceStatus};
pub use relay::{BackendPool, BackendSnapshot, TcpEngine, UdpEngine};
pub use resolver::DnsResolver;
