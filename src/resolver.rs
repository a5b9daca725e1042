use std::net::{IpAddr, SocketAddr};

use crate::error::NotFoundError;
use crate::table::AffinityTable;

/// Extract the client IP from a transport address, with or without a port.
///
/// Accepts `10.0.0.1`, `10.0.0.1:53`, `::1`, `[::1]` and `[::1]:53`.
/// IPv4-mapped IPv6 peers (what a dual-stack listener reports for IPv4
/// clients) come back as plain IPv4.
pub fn parse_client_ip(remote: &str) -> Option<IpAddr> {
    let remote = remote.trim();
    let ip = if let Ok(addr) = remote.parse::<SocketAddr>() {
        addr.ip()
    } else if let Ok(ip) = remote.parse::<IpAddr>() {
        ip
    } else {
        remote
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))?
            .parse::<IpAddr>()
            .ok()?
    };
    Some(ip.to_canonical())
}

/// Map a client address to its zone label.
///
/// An unparseable address is reported the same way as a table miss.
pub fn resolve_zone<'t>(table: &'t AffinityTable, remote: &str) -> Result<&'t str, NotFoundError> {
    parse_client_ip(remote)
        .and_then(|ip| table.lookup(ip))
        .ok_or_else(|| NotFoundError {
            client: remote.to_string(),
        })
}
