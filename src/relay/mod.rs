//! Relay engines and the failover backend pool.
//!
//! This module provides:
//! - Backend pool with sequential failover, two-strike accounting, and
//!   cooldown
//! - TCP engine: accept loop, dial via the pool, bidirectional splice
//! - UDP engine: datagram session table with idle eviction
//!
//! ## Architecture
//!
//! ```text
//! Client -> TCP/UDP Engine -> Backend Pool -> DNS Resolver
//!                                  |
//!                       failover state (strikes,
//!                       cooldown, rotation)
//! ```

mod pool;
mod tcp;
mod udp;

pub use pool::{BackendPool, BackendSnapshot, DEFAULT_DIAL_TIMEOUT};
pub use tcp::{TcpEngine, TcpStats, TCP_IDLE_TIMEOUT};
pub use udp::{UdpEngine, UdpStats, UDP_IDLE_TIMEOUT, UDP_SWEEP_INTERVAL};

use tokio::sync::watch;

/// Wait until the shutdown flag flips (or its sender is gone).
pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
