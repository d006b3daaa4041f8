//! Port negotiation: range validation and bind-probe availability checks.
//!
//! Probing is check-then-use: another process may claim the port between the
//! probe and the instance binding it. That window is accepted for a local
//! single-developer workflow.

use std::future::Future;
use std::net::Ipv4Addr;

use crate::error::{Result, SupervisorError};

/// Reports whether a TCP port can currently be bound on the local host.
pub trait PortProbe: Send + Sync + 'static {
    fn is_port_free(&self, port: u16) -> impl Future<Output = bool> + Send;
}

/// Probes by binding a throwaway listener on the wildcard address.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpPortProbe;

impl PortProbe for TcpPortProbe {
    fn is_port_free(&self, port: u16) -> impl Future<Output = bool> + Send {
        async move {
            match tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                // Listener is dropped here, releasing the port.
                Ok(_listener) => true,
                Err(e) => {
                    tracing::debug!(port, "port probe bind failed: {e}");
                    false
                }
            }
        }
    }
}

/// Narrow a caller-supplied port to `1..=65535`.
pub fn validate_port(port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(SupervisorError::InvalidPort(port)),
    }
}
