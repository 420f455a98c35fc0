//! Error types for the relay core.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// DNS resolution failure for a single host.
///
/// Cloneable so that concurrent callers sharing one in-flight lookup all
/// observe the leader's failure.
#[derive(Debug, Clone, Error)]
#[error("resolve {host} failed: {message}")]
pub struct ResolveError {
    /// Host that failed to resolve.
    pub host: String,
    /// Human-readable cause.
    pub message: String,
}

impl ResolveError {
    pub fn new(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            message: message.into(),
        }
    }
}

/// One backend's terminal failure within a dial attempt.
///
/// Carried inside [`RelayError::AllBackendsFailed`] so callers can see
/// which backends were tried and why each was given up on.
#[derive(Debug, Clone)]
pub struct BackendFailure {
    /// Original index of the backend in the configured list.
    pub backend: usize,
    /// The last error observed for that backend.
    pub error: String,
}

/// Errors produced by the relay core.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Host -> address resolution failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Connecting to one backend failed on every resolved address.
    #[error("dial {backend} failed: {source}")]
    Dial {
        backend: String,
        #[source]
        source: io::Error,
    },

    /// The pool exhausted its candidate list and the fallback without a
    /// successful dial.
    #[error("all backends failed after trying {} backend(s)", failures.len())]
    AllBackendsFailed { failures: Vec<BackendFailure> },

    /// A listening socket could not be opened.
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// I/O error outside an established session.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
