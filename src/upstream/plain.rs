//! Plain-DNS forwarders (UDP and TCP port 53).
//!
//! One connection per query, no pooling. Every I/O operation runs under a
//! 5-second deadline; a query that cannot complete in time is dropped and
//! the client experiences a resolver timeout.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::error::{DnsError, DnsResult, UpstreamStage};

/// Deadline applied to each upstream dial/write/read.
pub const PLAIN_DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Classic UDP DNS response limit (no EDNS0 negotiation on this path).
pub const MAX_UDP_RESPONSE: usize = 512;

/// Maximum DNS message size over TCP.
const MAX_TCP_RESPONSE: usize = 65_535;

/// Round-trip a wire-format query over UDP.
///
/// Dials an ephemeral socket to `upstream` (`host:port`), writes the query,
/// reads one response of at most [`MAX_UDP_RESPONSE`] bytes and returns it.
///
/// # Errors
///
/// Classified by stage: dial, write, read, or timeout.
pub async fn forward_udp(upstream: &str, query: &[u8]) -> DnsResult<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| DnsError::upstream(upstream, UpstreamStage::Dial, e.to_string()))?;

    timeout(PLAIN_DNS_TIMEOUT, socket.connect(upstream))
        .await
        .map_err(|_| DnsError::timeout(format!("UDP dial to {upstream}"), PLAIN_DNS_TIMEOUT))?
        .map_err(|e| DnsError::upstream(upstream, UpstreamStage::Dial, e.to_string()))?;

    timeout(PLAIN_DNS_TIMEOUT, socket.send(query))
        .await
        .map_err(|_| DnsError::timeout(format!("UDP write to {upstream}"), PLAIN_DNS_TIMEOUT))?
        .map_err(|e| DnsError::upstream(upstream, UpstreamStage::Write, e.to_string()))?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE];
    let n = timeout(PLAIN_DNS_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| DnsError::timeout(format!("UDP read from {upstream}"), PLAIN_DNS_TIMEOUT))?
        .map_err(|e| DnsError::upstream(upstream, UpstreamStage::Read, e.to_string()))?;

    buf.truncate(n);
    Ok(buf)
}

/// Round-trip a wire-format query over TCP.
///
/// Connects to `upstream`, writes the RFC 1035 2-byte length prefix followed
/// by the query, then reads the length-prefixed response. The returned bytes
/// are the response message without its length prefix.
///
/// # Errors
///
/// Classified by stage: dial, write, read, or timeout. A response length
/// prefix of zero is reported as a read failure.
pub async fn forward_tcp(upstream: &str, query: &[u8]) -> DnsResult<Vec<u8>> {
    let mut stream = timeout(PLAIN_DNS_TIMEOUT, TcpStream::connect(upstream))
        .await
        .map_err(|_| DnsError::timeout(format!("TCP dial to {upstream}"), PLAIN_DNS_TIMEOUT))?
        .map_err(|e| DnsError::upstream(upstream, UpstreamStage::Dial, e.to_string()))?;

    let prefix = u16::try_from(query.len())
        .map_err(|_| DnsError::parse(format!("query too large for TCP: {} bytes", query.len())))?
        .to_be_bytes();

    let write = async {
        stream.write_all(&prefix).await?;
        stream.write_all(query).await
    };
    timeout(PLAIN_DNS_TIMEOUT, write)
        .await
        .map_err(|_| DnsError::timeout(format!("TCP write to {upstream}"), PLAIN_DNS_TIMEOUT))?
        .map_err(|e| DnsError::upstream(upstream, UpstreamStage::Write, e.to_string()))?;

    let mut len_buf = [0u8; 2];
    timeout(PLAIN_DNS_TIMEOUT, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| DnsError::timeout(format!("TCP read from {upstream}"), PLAIN_DNS_TIMEOUT))?
        .map_err(|e| DnsError::upstream(upstream, UpstreamStage::Read, e.to_string()))?;

    let response_len = usize::from(u16::from_be_bytes(len_buf));
    if response_len == 0 || response_len > MAX_TCP_RESPONSE {
        return Err(DnsError::upstream(
            upstream,
            UpstreamStage::Read,
            format!("invalid response length: {response_len}"),
        ));
    }

    let mut response = vec![0u8; response_len];
    timeout(PLAIN_DNS_TIMEOUT, stream.read_exact(&mut response))
        .await
        .map_err(|_| DnsError::timeout(format!("TCP read from {upstream}"), PLAIN_DNS_TIMEOUT))?
        .map_err(|e| DnsError::upstream(upstream, UpstreamStage::Read, e.to_string()))?;

    Ok(response)
}
