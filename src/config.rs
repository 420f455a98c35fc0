//! Configuration snapshots.
//!
//! The relay core consumes already-validated [`RelayConfig`] snapshots. The
//! snapshot loaded from the TOML file at startup is one producer; a signal
//! handler, file watcher, or management API submitting a new snapshot to the
//! `ServiceManager` are others. All of them hand over the same type.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

/// Default cooldown applied to a twice-failed backend, in seconds.
pub const DEFAULT_BACKEND_COOLDOWN_SECS: u64 = 1800;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A service was declared without a name.
    #[error("service name must not be empty")]
    EmptyServiceName,

    /// Two services share the same name.
    #[error("duplicate service name: {0}")]
    DuplicateService(String),

    /// A service has no backends to forward to.
    #[error("service {0}: backends must not be empty")]
    NoBackends(String),

    /// A service listens on port 0.
    #[error("service {0}: listen port must be 1-65535")]
    InvalidListenPort(String),

    /// A backend string could not be parsed.
    #[error("invalid backend address '{spec}': {reason}")]
    InvalidBackend { spec: String, reason: String },
}

/// Transport protocols a service relays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    #[default]
    Both,
}

impl Protocol {
    /// Whether this service accepts TCP clients.
    pub fn tcp(&self) -> bool {
        matches!(self, Self::Tcp | Self::Both)
    }

    /// Whether this service accepts UDP clients.
    pub fn udp(&self) -> bool {
        matches!(self, Self::Udp | Self::Both)
    }
}

/// Local endpoint a service listens on.
///
/// The address is a bare IP literal; wildcards (`0.0.0.0`, `::`) are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ListenConfig {
    pub address: IpAddr,
    pub port: u16,
}

impl ListenConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for ListenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// A single upstream target.
///
/// Parsed from one of `host:port`, `ipv4:port`, or `[ipv6]:port`. Identity
/// for state preservation across reconfiguration is host + port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct BackendSpec {
    pub host: String,
    pub port: u16,
}

impl BackendSpec {
    /// Parse a backend string in any of the three accepted forms.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidBackend {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = spec.trim();
        let (host, port_str) = if let Some(rest) = trimmed.strip_prefix('[') {
            // "[ipv6]:port"
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| invalid("missing closing bracket"))?;
            if host.parse::<Ipv6Addr>().is_err() {
                return Err(invalid("bracketed host is not an IPv6 address"));
            }
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port after ']'"))?;
            (host, port)
        } else {
            // "host:port" or "ipv4:port"
            let (host, port) = trimmed
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port"))?;
            if host.contains(':') {
                return Err(invalid("IPv6 addresses must be bracketed"));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| invalid("port is not a number"))?;
        if port == 0 {
            return Err(invalid("port must be 1-65535"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for BackendSpec {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl fmt::Display for BackendSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One relayed service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceConfig {
    /// Unique service name, used as the stable identity across snapshots.
    pub name: String,

    /// Which transports to accept.
    #[serde(default)]
    pub protocol: Protocol,

    /// Local listen endpoint.
    pub listen: ListenConfig,

    /// Ordered failover list of upstream targets.
    pub backends: Vec<BackendSpec>,

    /// Cooldown for a twice-failed backend, in seconds. 0 disables cooldown.
    #[serde(default = "default_backend_cooldown")]
    pub backend_cooldown: u64,
}

fn default_backend_cooldown() -> u64 {
    DEFAULT_BACKEND_COOLDOWN_SECS
}

impl ServiceConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.backend_cooldown)
    }
}

/// A validated configuration snapshot: the desired set of services.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl RelayConfig {
    /// The empty snapshot. Applying it stops every running service.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load and validate a snapshot from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check snapshot-level invariants not expressible in the field types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = Vec::with_capacity(self.services.len());
        for service in &self.services {
            if service.name.is_empty() {
                return Err(ConfigError::EmptyServiceName);
            }
            if seen.contains(&&service.name) {
                return Err(ConfigError::DuplicateService(service.name.clone()));
            }
            seen.push(&service.name);
            if service.backends.is_empty() {
                return Err(ConfigError::NoBackends(service.name.clone()));
            }
            if service.listen.port == 0 {
                return Err(ConfigError::InvalidListenPort(service.name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_backend_hostname() {
        let spec = BackendSpec::parse("ns1.internal.example:53").unwrap();
        assert_eq!(spec.host, "ns1.internal.example");
        assert_eq!(spec.port, 53);
    }

    #[test]
    fn parse_backend_ipv4() {
        let spec = BackendSpec::parse("10.0.0.1:8080").unwrap();
        assert_eq!(spec.host, "10.0.0.1");
        assert_eq!(spec.port, 8080);
    }

    #[test]
    fn parse_backend_ipv6_bracketed() {
        let spec = BackendSpec::parse("[2001:db8::53]:53").unwrap();
        assert_eq!(spec.host, "2001:db8::53");
        assert_eq!(spec.port, 53);
        assert_eq!(spec.to_string(), "[2001:db8::53]:53");
    }

    #[test]
    fn parse_backend_rejects_bad_input() {
        assert!(BackendSpec::parse("no-port").is_err());
        assert!(BackendSpec::parse(":80").is_err());
        assert!(BackendSpec::parse("host:notaport").is_err());
        assert!(BackendSpec::parse("host:0").is_err());
        // Unbracketed IPv6 is ambiguous with the port separator.
        assert!(BackendSpec::parse("2001:db8::1:53").is_err());
        assert!(BackendSpec::parse("[2001:db8::1:53").is_err());
        assert!(BackendSpec::parse("[not-an-ip]:53").is_err());
    }

    #[test]
    fn parse_full_config() {
        let raw = r#"
            [[services]]
            name = "dns-edge"
            protocol = "both"
            listen = { address = "0.0.0.0", port = 5353 }
            backends = ["10.0.0.1:53", "[2001:db8::53]:53", "ns1.internal.example:53"]
            backend_cooldown = 60

            [[services]]
            name = "pg"
            protocol = "tcp"
            listen = { address = "::", port = 5432 }
            backends = ["db.internal.example:5432"]
        "#;

        let config: RelayConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.services.len(), 2);
        let dns = &config.services[0];
        assert_eq!(dns.protocol, Protocol::Both);
        assert_eq!(dns.backends.len(), 3);
        assert_eq!(dns.backends[1].host, "2001:db8::53");
        assert_eq!(dns.backend_cooldown, 60);

        let pg = &config.services[1];
        assert_eq!(pg.protocol, Protocol::Tcp);
        assert!(pg.protocol.tcp());
        assert!(!pg.protocol.udp());
        assert_eq!(pg.backend_cooldown, DEFAULT_BACKEND_COOLDOWN_SECS);
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let raw = r#"
            [[services]]
            name = "a"
            listen = { address = "127.0.0.1", port = 1000 }
            backends = ["b:1"]

            [[services]]
            name = "a"
            listen = { address = "127.0.0.1", port = 1001 }
            backends = ["b:1"]
        "#;
        let config: RelayConfig = toml::from_str(raw).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateService(_))
        ));
    }

    #[test]
    fn validate_rejects_empty_backends() {
        let raw = r#"
            [[services]]
            name = "a"
            listen = { address = "127.0.0.1", port = 1000 }
            backends = []
        "#;
        let config: RelayConfig = toml::from_str(raw).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NoBackends(_))));
    }
}
