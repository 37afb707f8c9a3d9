//! End-to-end proxy tests.
//!
//! Each test runs a real listener on a loopback port with a stub upstream
//! resolver behind it, then drives wire-format queries through the full
//! parse → match → block/forward pipeline.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use dnsmesh::config::TlsStore;
use dnsmesh::matcher::DomainMatcher;
use dnsmesh::server::{DnsHandler, HandlerConfig, TcpDnsServer, UdpDnsServer};
use dnsmesh::upstream::DohTlsConfig;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Encode a single-question DNS query.
fn build_query(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(32 + domain.len());
    data.extend_from_slice(&id.to_be_bytes());
    data.extend_from_slice(&[0x01, 0x00]); // RD
    data.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in domain.split('.') {
        data.push(label.len() as u8);
        data.extend_from_slice(label.as_bytes());
    }
    data.push(0);
    data.extend_from_slice(&qtype.to_be_bytes());
    data.extend_from_slice(&1u16.to_be_bytes());
    data
}

fn is_nxdomain(response: &[u8]) -> bool {
    response.len() >= 12 && response[2] & 0x80 != 0 && response[3] & 0x0F == 3
}

fn is_upstream_answer(response: &[u8]) -> bool {
    // The stub upstream echoes the query with QR set and RCODE NoError.
    response.len() >= 12 && response[2] & 0x80 != 0 && response[3] & 0x0F == 0
}

/// Stub plain-DNS upstream answering every UDP query by echoing it with the
/// QR bit set.
async fn spawn_udp_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let mut response = buf[..len].to_vec();
            if response.len() >= 4 {
                response[2] |= 0x80;
            }
            let _ = socket.send_to(&response, peer).await;
        }
    });
    addr
}

/// Stub plain-DNS upstream answering one framed TCP query the same way.
async fn spawn_tcp_upstream() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut len_buf = [0u8; 2];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    return;
                }
                let len = usize::from(u16::from_be_bytes(len_buf));
                let mut query = vec![0u8; len];
                if stream.read_exact(&mut query).await.is_err() {
                    return;
                }
                if query.len() >= 4 {
                    query[2] |= 0x80;
                }
                let _ = stream.write_all(&len_buf).await;
                let _ = stream.write_all(&query).await;
            });
        }
    });
    addr
}

struct Proxy {
    handler: Arc<DnsHandler>,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
}

fn make_handler(upstream: SocketAddr, rules: &[&str]) -> Arc<DnsHandler> {
    let handler = Arc::new(DnsHandler::new(
        HandlerConfig {
            upstream: upstream.to_string(),
            doh_enabled: false,
            doh_upstream: "https://1.1.1.1/dns-query".to_string(),
            doh_timeout: Duration::from_secs(10),
            tls: DohTlsConfig::default(),
        },
        Arc::new(TlsStore::new()),
    ));
    handler.update_matcher(DomainMatcher::from_rules(rules.iter().copied()));
    handler
}

/// Start a UDP listener backed by a stub UDP upstream.
async fn spawn_proxy(rules: &[&str]) -> Proxy {
    let upstream = spawn_udp_upstream().await;
    let handler = make_handler(upstream, rules);

    let udp = UdpDnsServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&handler))
        .await
        .unwrap();
    let udp_addr = udp.local_addr();
    tokio::spawn(async move {
        let _ = udp.run().await;
    });

    Proxy {
        handler,
        udp_addr,
        tcp_addr: udp_addr,
    }
}

/// Start a TCP listener backed by a stub TCP upstream.
async fn spawn_tcp_proxy(rules: &[&str]) -> Proxy {
    let upstream = spawn_tcp_upstream().await;
    let handler = make_handler(upstream, rules);

    let tcp = TcpDnsServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&handler))
        .await
        .unwrap();
    let tcp_addr = tcp.local_addr();
    tokio::spawn(async move {
        let _ = tcp.run().await;
    });

    Proxy {
        handler,
        udp_addr: tcp_addr,
        tcp_addr,
    }
}

async fn udp_roundtrip(proxy_addr: SocketAddr, query: &[u8]) -> Vec<u8> {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(query, proxy_addr).await.unwrap();
    let mut buf = [0u8; 512];
    let (len, _) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf))
        .await
        .expect("no response within deadline")
        .unwrap();
    buf[..len].to_vec()
}

async fn tcp_roundtrip(proxy_addr: SocketAddr, query: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let prefix = (query.len() as u16).to_be_bytes();
    stream.write_all(&prefix).await.unwrap();
    stream.write_all(query).await.unwrap();

    let mut len_buf = [0u8; 2];
    timeout(RECV_TIMEOUT, stream.read_exact(&mut len_buf))
        .await
        .expect("no response within deadline")
        .unwrap();
    let len = usize::from(u16::from_be_bytes(len_buf));
    let mut response = vec![0u8; len];
    stream.read_exact(&mut response).await.unwrap();
    response
}

// ============================================================================
// UDP scenarios
// ============================================================================

#[tokio::test]
async fn exact_rule_blocks_with_nxdomain() {
    let proxy = spawn_proxy(&["example.com", "*.ads.net"]).await;

    let query = build_query(0x1111, "example.com", 1);
    let response = udp_roundtrip(proxy.udp_addr, &query).await;

    assert!(is_nxdomain(&response));
    assert_eq!(&response[0..2], &query[0..2]); // ID preserved
    assert_eq!(&response[12..], &query[12..]); // question preserved
}

#[tokio::test]
async fn wildcard_rule_blocks_subtree() {
    let proxy = spawn_proxy(&["example.com", "*.ads.net"]).await;

    let response = udp_roundtrip(proxy.udp_addr, &build_query(0x2222, "banner.ads.net", 1)).await;
    assert!(is_nxdomain(&response));
}

#[tokio::test]
async fn wildcard_apex_is_forwarded() {
    let proxy = spawn_proxy(&["example.com", "*.ads.net"]).await;

    let response = udp_roundtrip(proxy.udp_addr, &build_query(0x3333, "ads.net", 1)).await;
    assert!(is_upstream_answer(&response));
    assert!(!is_nxdomain(&response));
}

#[tokio::test]
async fn catch_all_blocks_any_name() {
    let proxy = spawn_proxy(&["*"]).await;

    let response = udp_roundtrip(proxy.udp_addr, &build_query(0x4444, "anything.test", 28)).await;
    assert!(is_nxdomain(&response));
}

#[tokio::test]
async fn longest_suffix_rule_wins() {
    let proxy = spawn_proxy(&["*.com", "*.example.com"]).await;

    let response = udp_roundtrip(proxy.udp_addr, &build_query(0x5555, "x.example.com", 1)).await;
    assert!(is_nxdomain(&response));
}

#[tokio::test]
async fn unmatched_name_is_forwarded() {
    let proxy = spawn_proxy(&["example.com"]).await;

    let response = udp_roundtrip(proxy.udp_addr, &build_query(0x6666, "other.org", 1)).await;
    assert!(is_upstream_answer(&response));
}

#[tokio::test]
async fn dry_run_forwards_blocked_names() {
    let proxy = spawn_proxy(&["example.com"]).await;
    proxy.handler.dry_run_flag().store(true, Ordering::Relaxed);

    let response = udp_roundtrip(proxy.udp_addr, &build_query(0x7777, "example.com", 1)).await;
    assert!(is_upstream_answer(&response));
    assert!(!is_nxdomain(&response));
}

#[tokio::test]
async fn hot_swap_applies_to_next_query() {
    let proxy = spawn_proxy(&[]).await;

    let response = udp_roundtrip(proxy.udp_addr, &build_query(0x8888, "soon-blocked.com", 1)).await;
    assert!(is_upstream_answer(&response));

    proxy
        .handler
        .update_matcher(DomainMatcher::from_rules(["soon-blocked.com"]));

    let response = udp_roundtrip(proxy.udp_addr, &build_query(0x8889, "soon-blocked.com", 1)).await;
    assert!(is_nxdomain(&response));
}

// ============================================================================
// TCP scenarios
// ============================================================================

#[tokio::test]
async fn tcp_blocked_query_gets_framed_nxdomain() {
    let proxy = spawn_tcp_proxy(&["blocked.example.com"]).await;

    let query = build_query(0x9999, "blocked.example.com", 1);
    let response = tcp_roundtrip(proxy.tcp_addr, &query).await;

    assert!(is_nxdomain(&response));
    assert_eq!(&response[0..2], &query[0..2]);
}

#[tokio::test]
async fn tcp_allowed_query_is_relayed() {
    let proxy = spawn_tcp_proxy(&["blocked.example.com"]).await;

    let response = tcp_roundtrip(proxy.tcp_addr, &build_query(0xAAAA, "fine.example.org", 1)).await;
    assert!(is_upstream_answer(&response));
}

#[tokio::test]
async fn tcp_wildcard_apex_excluded() {
    let proxy = spawn_tcp_proxy(&["*.ads.net"]).await;

    let blocked = tcp_roundtrip(proxy.tcp_addr, &build_query(1, "x.ads.net", 1)).await;
    assert!(is_nxdomain(&blocked));

    let allowed = tcp_roundtrip(proxy.tcp_addr, &build_query(2, "ads.net", 1)).await;
    assert!(is_upstream_answer(&allowed));
}
