//! TCP DNS listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use super::handler::DnsHandler;
use crate::error::{DnsError, DnsResult};

/// TCP DNS server.
///
/// Accepts connections and hands each one to its own worker task. Messages
/// are 2-byte big-endian length-prefixed per RFC 1035 §4.2.2; the worker
/// enforces a 5-second client read deadline and closes the connection on
/// every exit path.
pub struct TcpDnsServer {
    listener: TcpListener,
    handler: Arc<DnsHandler>,
    local_addr: SocketAddr,
}

impl TcpDnsServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn bind(addr: SocketAddr, handler: Arc<DnsHandler>) -> DnsResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to bind TCP listener to {addr}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to get local address", e))?;

        info!(addr = %local_addr, "DNS proxy listening on TCP");

        Ok(Self {
            listener,
            handler,
            local_addr,
        })
    }

    /// The bound address (useful when binding port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop. Accept errors are logged and the loop continues.
    pub async fn run(&self) -> DnsResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(handler.handle_tcp_conn(stream, peer));
                }
                Err(e) => {
                    warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
}
