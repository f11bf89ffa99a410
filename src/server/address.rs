//! Listen address parsing and peer classification.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use tracing::warn;

/// A `[bind:]port` listen address.
///
/// `bind` may be a host, an IP, or `#<iface>` for the first IPv4 address of
/// a network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    pub bind: Option<String>,
    pub port: u16,
}

impl ListenAddress {
    pub fn any(port: u16) -> Self {
        Self { bind: None, port }
    }

    /// Resolve to a socket address.
    ///
    /// An unknown interface falls back to all interfaces.
    pub fn resolve(&self) -> io::Result<SocketAddr> {
        let bind = match self.bind.as_deref() {
            None | Some("") => {
                return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port))
            }
            Some(bind) => bind,
        };

        if let Some(iface) = bind.strip_prefix('#') {
            let ip = interface_ipv4(iface).unwrap_or_else(|| {
                warn!(interface = iface, "Interface has no IPv4 address, binding to all");
                Ipv4Addr::UNSPECIFIED
            });
            return Ok(SocketAddr::new(IpAddr::V4(ip), self.port));
        }

        (bind, self.port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {bind}"))
        })
    }
}

impl FromStr for ListenAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (bind, port) = match s.rsplit_once(':') {
            Some((bind, port)) => (Some(bind.trim().to_string()), port),
            None => (None, s),
        };
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid port in '{s}'"))?;
        Ok(Self {
            bind: bind.filter(|b| !b.is_empty()),
            port,
        })
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bind {
            Some(bind) => write!(f, "{bind}:{}", self.port),
            None => write!(f, "{}", self.port),
        }
    }
}

/// First IPv4 address of the named interface.
#[cfg(unix)]
pub fn interface_ipv4(name: &str) -> Option<Ipv4Addr> {
    use std::ffi::CStr;
    use std::ptr;

    let mut addrs: *mut libc::ifaddrs = ptr::null_mut();
    // SAFETY: getifaddrs fills `addrs` with a list freed below.
    if unsafe { libc::getifaddrs(&mut addrs) } != 0 {
        return None;
    }

    let mut found = None;
    let mut cur = addrs;
    while !cur.is_null() {
        // SAFETY: `cur` walks the list returned by getifaddrs.
        let ifa = unsafe { &*cur };
        cur = ifa.ifa_next;
        if ifa.ifa_addr.is_null() || ifa.ifa_name.is_null() {
            continue;
        }
        // SAFETY: non-null pointers into the same list.
        let (family, ifname) = unsafe {
            (
                (*ifa.ifa_addr).sa_family as i32,
                CStr::from_ptr(ifa.ifa_name),
            )
        };
        if family != libc::AF_INET || ifname.to_bytes() != name.as_bytes() {
            continue;
        }
        // SAFETY: AF_INET entries carry a sockaddr_in.
        let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
        found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
        break;
    }

    // SAFETY: `addrs` came from getifaddrs.
    unsafe { libc::freeifaddrs(addrs) };
    found
}

#[cfg(not(unix))]
pub fn interface_ipv4(_name: &str) -> Option<Ipv4Addr> {
    None
}

/// Private-network addresses, exempt from deny-listing on protocol abuse.
pub fn is_site_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => is_site_local_v6(&v6),
    }
}

fn is_site_local_v6(v6: &Ipv6Addr) -> bool {
    // fec0::/10
    (v6.segments()[0] & 0xffc0) == 0xfec0
}

/// Host name used in logs; loopback and unspecified become `localhost`.
pub fn display_host(ip: IpAddr) -> String {
    if ip.is_loopback() || ip.is_unspecified() {
        "localhost".to_string()
    } else {
        ip.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_only() {
        let addr: ListenAddress = "8090".parse().unwrap();
        assert_eq!(addr, ListenAddress::any(8090));
        assert_eq!(addr.to_string(), "8090");
    }

    #[test]
    fn test_parse_bind_and_port() {
        let addr: ListenAddress = "127.0.0.1:8443".parse().unwrap();
        assert_eq!(addr.bind.as_deref(), Some("127.0.0.1"));
        assert_eq!(addr.port, 8443);
        assert_eq!(
            addr.resolve().unwrap(),
            "127.0.0.1:8443".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!("abc".parse::<ListenAddress>().is_err());
        assert!("host:99999".parse::<ListenAddress>().is_err());
    }

    #[test]
    fn test_resolve_all_interfaces() {
        let addr = ListenAddress::any(0).resolve().unwrap();
        assert!(addr.ip().is_unspecified());
    }

    #[test]
    fn test_unknown_interface_binds_all() {
        let addr: ListenAddress = "#no-such-iface0:9000".parse().unwrap();
        let resolved = addr.resolve().unwrap();
        assert!(resolved.ip().is_unspecified());
        assert_eq!(resolved.port(), 9000);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_loopback_interface() {
        assert_eq!(interface_ipv4("lo"), Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_site_local() {
        assert!(is_site_local("192.168.1.5".parse().unwrap()));
        assert!(is_site_local("10.1.2.3".parse().unwrap()));
        assert!(!is_site_local("8.8.8.8".parse().unwrap()));
        assert!(!is_site_local("127.0.0.1".parse().unwrap()));
        assert!(is_site_local("fec0::1".parse().unwrap()));
    }

    #[test]
    fn test_display_host() {
        assert_eq!(display_host("127.0.0.1".parse().unwrap()), "localhost");
        assert_eq!(display_host("0.0.0.0".parse().unwrap()), "localhost");
        assert_eq!(display_host("1.2.3.4".parse().unwrap()), "1.2.3.4");
    }
}
