//! UDP DNS listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{info, warn};

use super::handler::DnsHandler;
use crate::error::{DnsError, DnsResult};

/// Classic UDP DNS message limit; queries beyond this are truncated by the
/// transport and rejected at parse time.
pub const MAX_UDP_PACKET: usize = 512;

/// UDP DNS server.
///
/// Reads datagrams into a fixed 512-byte buffer, copies out the used bytes
/// (the buffer is reused on the next read) and dispatches one worker task
/// per query. Workers answer through the shared listening socket, which is
/// safe for concurrent sends.
pub struct UdpDnsServer {
    socket: Arc<UdpSocket>,
    handler: Arc<DnsHandler>,
    local_addr: SocketAddr,
}

impl UdpDnsServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(addr: SocketAddr, handler: Arc<DnsHandler>) -> DnsResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to bind UDP socket to {addr}"), e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to get local address", e))?;

        info!(addr = %local_addr, "DNS proxy listening on UDP");

        Ok(Self {
            socket: Arc::new(socket),
            handler,
            local_addr,
        })
    }

    /// The bound address (useful when binding port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the receive loop. Never returns under normal operation; read
    /// errors are logged and the loop continues.
    pub async fn run(&self) -> DnsResult<()> {
        let mut buf = [0u8; MAX_UDP_PACKET];

        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "UDP read error");
                    continue;
                }
            };

            // The shared buffer is overwritten by the next read; the worker
            // gets its own copy of the used bytes.
            let query = buf[..len].to_vec();
            let handler = Arc::clone(&self.handler);
            let socket = Arc::clone(&self.socket);
            tokio::spawn(handler.handle_udp_query(socket, peer, query));
        }
    }
}
