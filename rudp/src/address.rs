//! Network addresses
//!
//! A thin pairing of IP address and port with hostname resolution, kept
//! separate from `SocketAddr` so the engine's public surface stays small.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use crate::Error;

/// An endpoint the engine can bind to or connect to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    ip: IpAddr,
    port: u16,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Address { ip, port }
    }

    /// The wildcard IPv4 address on `port`; binds to every interface
    pub fn any(port: u16) -> Self {
        Address {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
        }
    }

    /// Resolve a hostname, taking the first address returned
    pub fn resolve(hostname: &str, port: u16) -> Result<Self, Error> {
        let mut addrs = (hostname, port)
            .to_socket_addrs()
            .map_err(|e| Error::Resolution(format!("{hostname}: {e}")))?;
        match addrs.next() {
            Some(addr) => Ok(addr.into()),
            None => Err(Error::Resolution(format!(
                "{hostname}: no addresses returned"
            ))),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::new(self.ip, self.port).fmt(f)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        SocketAddr::new(addr.ip, addr.port)
    }
}
