use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use get_if_addrs::get_if_addrs;

/// Picks the local IPv4 address renderers should use to reach the bridge.
///
/// First asks the OS which interface would route toward the outside (a UDP
/// "connect" does not send anything), then falls back to the first
/// non-loopback interface, then to 127.0.0.1.
pub fn local_ipv4() -> Ipv4Addr {
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(local) = socket.local_addr() {
                if let IpAddr::V4(ip) = local.ip() {
                    return ip;
                }
            }
        }
    }

    if let Ok(interfaces) = get_if_addrs() {
        for iface in interfaces {
            if let IpAddr::V4(ip) = iface.ip() {
                if !ip.is_loopback() {
                    return ip;
                }
            }
        }
    }

    tracing::warn!("no usable interface found, falling back to loopback");
    Ipv4Addr::LOCALHOST
}
