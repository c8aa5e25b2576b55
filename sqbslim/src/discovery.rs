//! LMS discovery by UDP broadcast.
//!
//! The probe payload is `e` followed by the NUL-separated tag names VERS,
//! JSON and CLIP; the server answers with the same tags, each followed by
//! a length byte and the value.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub const SLIM_PORT: u16 = 3483;

#[derive(Debug, Clone)]
pub struct DiscoveredServer {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub version: String,
    /// LMS web/JSON port.
    pub http_port: u16,
    /// CLI line-protocol port.
    pub cli_port: u16,
}

fn probe_payload() -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.push(b'e');
    buf.extend_from_slice(b"VERS");
    buf.push(0);
    buf.extend_from_slice(b"JSON");
    buf.push(0);
    buf.extend_from_slice(b"CLIP");
    buf.push(0);
    buf
}

/// Extracts a `TAG<len><value>` field from a discovery reply.
fn find_tag(reply: &[u8], tag: &[u8]) -> Option<String> {
    let pos = reply.windows(tag.len()).position(|w| w == tag)?;
    let len_pos = pos + tag.len();
    let length = usize::from(*reply.get(len_pos)?);
    let value = reply.get(len_pos + 1..len_pos + 1 + length)?;
    Some(String::from_utf8_lossy(value).into_owned())
}

/// Parses a discovery reply from `addr`.
pub fn parse_reply(reply: &[u8], addr: SocketAddrV4) -> DiscoveredServer {
    let version = find_tag(reply, b"VERS").unwrap_or_default();
    let http_port = find_tag(reply, b"JSON")
        .and_then(|v| v.parse().ok())
        .unwrap_or(9000);
    let cli_port = find_tag(reply, b"CLIP")
        .and_then(|v| v.parse().ok())
        .unwrap_or(crate::cli::CLI_PORT_DEFAULT);
    DiscoveredServer {
        ip: *addr.ip(),
        port: addr.port(),
        version,
        http_port,
        cli_port,
    }
}

/// One discovery round: broadcast (or directed probe when the address is
/// pinned) and wait up to `timeout` for a reply.
pub async fn discover_once(
    local: Ipv4Addr,
    target: Option<Ipv4Addr>,
    timeout: Duration,
) -> Option<DiscoveredServer> {
    let socket = match target {
        // some systems refuse to broadcast on an unbound socket
        None => UdpSocket::bind((local, 0)).await.ok()?,
        Some(_) => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?,
    };
    if socket.set_broadcast(true).is_err() {
        warn!("cannot enable broadcast for discovery");
    }

    let destination = SocketAddrV4::new(target.unwrap_or(Ipv4Addr::BROADCAST), SLIM_PORT);
    debug!("sending discovery to {destination}");
    if let Err(err) = socket.send_to(&probe_payload(), destination).await {
        warn!("error sending discovery: {err}");
        return None;
    }

    let mut reply = [0u8; 128];
    let received = tokio::time::timeout(timeout, socket.recv_from(&mut reply)).await;
    match received {
        Ok(Ok((len, std::net::SocketAddr::V4(addr)))) => {
            debug!("got response from: {addr}");
            Some(parse_reply(&reply[..len], addr))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_reply() {
        let mut reply = b"E".to_vec();
        reply.extend_from_slice(b"VERS");
        reply.push(5);
        reply.extend_from_slice(b"8.3.1");
        reply.extend_from_slice(b"JSON");
        reply.push(4);
        reply.extend_from_slice(b"9000");
        reply.extend_from_slice(b"CLIP");
        reply.push(4);
        reply.extend_from_slice(b"9090");

        let server = parse_reply(&reply, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 3483));
        assert_eq!(server.version, "8.3.1");
        assert_eq!(server.http_port, 9000);
        assert_eq!(server.cli_port, 9090);
        assert_eq!(server.ip, Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn missing_tags_use_defaults() {
        let server = parse_reply(b"E", SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 3483));
        assert_eq!(server.cli_port, 9090);
        assert!(server.version.is_empty());
    }

    #[test]
    fn probe_layout() {
        let probe = probe_payload();
        assert_eq!(probe[0], b'e');
        assert_eq!(&probe[1..5], b"VERS");
        assert_eq!(probe[5], 0);
        assert_eq!(&probe[6..10], b"JSON");
        assert_eq!(&probe[11..15], b"CLIP");
    }
}
