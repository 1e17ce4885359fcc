//! Local address discovery and endpoint formatting.

use crate::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::debug;

/// Every address configured on a local interface, in interface order.
///
/// IPv6 link-local addresses are skipped: they are unusable in a URL
/// without a zone identifier.
pub fn local_addresses() -> Result<Vec<IpAddr>> {
    let interfaces = if_addrs::get_if_addrs()
        .map_err(|e| Error::Network(format!("Failed to enumerate interfaces: {e}")))?;

    let mut addresses: Vec<IpAddr> = Vec::with_capacity(interfaces.len());
    for interface in interfaces {
        let ip = interface.ip();
        if is_ipv6_link_local(&ip) {
            debug!(interface = %interface.name, %ip, "Skipping link-local address");
            continue;
        }
        if !addresses.contains(&ip) {
            addresses.push(ip);
        }
    }

    if addresses.is_empty() {
        return Err(Error::Network("no local addresses found".to_string()));
    }
    Ok(addresses)
}

fn is_ipv6_link_local(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if (v6.segments()[0] & 0xffc0) == 0xfe80)
}

/// `https://host:port`, with IPv6 hosts in brackets.
pub fn endpoint_url(ip: IpAddr, port: u16) -> String {
    format!("https://{}", SocketAddr::new(ip, port))
}

pub fn endpoint_port(endpoint: &str) -> Result<u16> {
    let url = url::Url::parse(endpoint)
        .map_err(|e| Error::Config(format!("invalid endpoint {endpoint:?}: {e}")))?;
    url.port_or_known_default()
        .ok_or_else(|| Error::Config(format!("endpoint {endpoint:?} has no port")))
}

/// Wildcard listen addresses for `port`, dual-stack first.
pub fn wildcard_addrs(port: u16) -> [SocketAddr; 2] {
    [
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
    ]
}
