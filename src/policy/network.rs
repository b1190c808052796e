use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::path::PathBuf;

use crate::error::Error;

/// One entry of the allowed-networks list, already routed to the address
/// family it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedNetwork {
    Unix { path: PathBuf, listen: bool },
    V4 { addr: SocketAddrV4, listen: bool },
    V6 { addr: SocketAddrV6, listen: bool },
}

/// The resolved, family-split allow-lists plus the two global permission
/// bits, built up from the configuration document's `allowed_networks`
/// entries (path / domain / literal-address parsing).
#[derive(Debug, Clone, Default)]
pub struct NetworkPolicy {
    pub allow_connect: bool,
    pub allow_listen: bool,
    pub unix: Vec<(PathBuf, bool)>,
    pub v4: Vec<(SocketAddrV4, bool)>,
    pub v6: Vec<(SocketAddrV6, bool)>,
}

impl NetworkPolicy {
    pub fn push(&mut self, entry: AllowedNetwork) {
        match entry {
            AllowedNetwork::Unix { path, listen } => self.unix.push((path, listen)),
            AllowedNetwork::V4 { addr, listen } => self.v4.push((addr, listen)),
            AllowedNetwork::V6 { addr, listen } => self.v6.push((addr, listen)),
        }
    }

    /// Whether a connect to `addr:port` should be admitted, honoring the
    /// global `allow_connect` flag and per-entry allow-list membership.
    pub fn admits_connect(&self, addr: Ipv4Addr, port: u16) -> bool {
        self.allow_connect || self.v4.iter().any(|(a, _)| *a.ip() == addr && a.port() == port)
    }

    /// Whether a listen bind on `addr:port` should be admitted: the same
    /// base admission as `admits_connect`, additionally gated on either the
    /// global `allow_listen` flag or the matching entry's own `listen` bit.
    pub fn admits_listen(&self, addr: Ipv4Addr, port: u16) -> bool {
        let entry = self.v4.iter().find(|(a, _)| *a.ip() == addr && a.port() == port);
        let base_admit = self.allow_connect || entry.is_some();
        let listen_ok = self.allow_listen || entry.map(|(_, listen)| *listen).unwrap_or(false);
        base_admit && listen_ok
    }
}

/// Parse one `allowed_networks` document entry. Exactly one of `path`,
/// `domain`, `address` is expected; `domain` is resolved via the system
/// resolver at load time to its first result of either family.
pub fn resolve_network_entry(
    path: Option<&str>,
    domain: Option<&str>,
    address: Option<&str>,
    port: Option<u16>,
    listen: bool,
) -> Result<AllowedNetwork, Error> {
    if let Some(p) = path {
        return Ok(AllowedNetwork::Unix {
            path: PathBuf::from(p),
            listen,
        });
    }
    if let Some(addr) = address {
        if addr.contains(':') {
            let ip: Ipv6Addr = addr.parse().map_err(|_| Error::ConfigError {
                message: "malformed IPv6 literal".into(),
                fragment: addr.to_string(),
            })?;
            return Ok(AllowedNetwork::V6 {
                addr: SocketAddrV6::new(ip, port.unwrap_or(0), 0, 0),
                listen,
            });
        }
        if addr.contains('.') {
            let ip: Ipv4Addr = addr.parse().map_err(|_| Error::ConfigError {
                message: "malformed IPv4 literal".into(),
                fragment: addr.to_string(),
            })?;
            return Ok(AllowedNetwork::V4 {
                addr: SocketAddrV4::new(ip, port.unwrap_or(0)),
                listen,
            });
        }
        return Err(Error::ConfigError {
            message: "address is neither IPv4 nor IPv6".into(),
            fragment: addr.to_string(),
        });
    }
    if let Some(name) = domain {
        let lookup = format!("{name}:{}", port.unwrap_or(0));
        let mut resolved = lookup.to_socket_addrs().map_err(|e| Error::ConfigError {
            message: format!("could not resolve domain: {e}"),
            fragment: name.to_string(),
        })?;
        return match resolved.next() {
            Some(std::net::SocketAddr::V4(a)) => Ok(AllowedNetwork::V4 { addr: a, listen }),
            Some(std::net::SocketAddr::V6(a)) => Ok(AllowedNetwork::V6 { addr: a, listen }),
            None => Err(Error::ConfigError {
                message: "domain resolved to no addresses".into(),
                fragment: name.to_string(),
            }),
        };
    }
    Err(Error::ConfigError {
        message: "allowed_networks entry has neither path, domain, nor address".into(),
        fragment: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_v4_routes_to_v4_list() {
        let e = resolve_network_entry(None, None, Some("127.0.0.1"), Some(80), false).unwrap();
        assert!(matches!(e, AllowedNetwork::V4 { .. }));
    }

    #[test]
    fn literal_v6_routes_to_v6_list() {
        let e = resolve_network_entry(None, None, Some("::1"), Some(80), false).unwrap();
        assert!(matches!(e, AllowedNetwork::V6 { .. }));
    }

    #[test]
    fn unix_path_routes_to_unix_list() {
        let e = resolve_network_entry(Some("/run/sock"), None, None, None, false).unwrap();
        assert!(matches!(e, AllowedNetwork::Unix { .. }));
    }

    #[test]
    fn admits_connect_checks_allowlist_when_not_globally_allowed() {
        let mut policy = NetworkPolicy::default();
        policy.push(AllowedNetwork::V4 {
            addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 443),
            listen: false,
        });
        assert!(policy.admits_connect(Ipv4Addr::new(10, 0, 0, 1), 443));
        assert!(!policy.admits_connect(Ipv4Addr::new(10, 0, 0, 2), 443));
    }
}
