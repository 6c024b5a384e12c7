//! Address handling: the textual form applications deal in, the opaque
//! binary form used as a connection key, and the blocking resolver between
//! them. Name resolution is the only place the library ever blocks.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// Port assumed when a textual address does not name one.
pub const DEFAULT_PORT: u16 = 4812;

const MAX_HOST_LEN: usize = 120;
const MAX_PORT_LEN: usize = 8;

/// A textual internet address: dotted-quad or colon-hex host, decimal port.
/// An empty port string selects [`DEFAULT_PORT`] at resolution.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TextAddr {
    pub addr: String,
    pub port: String,
}

impl TextAddr {
    #[inline]
    pub fn new(addr: &str, port: &str) -> TextAddr {
        TextAddr {
            addr: addr.to_string(),
            port: port.to_string(),
        }
    }

    /// Formats a resolved socket address back into text.
    pub fn from_socket_addr(addr: &SocketAddr) -> TextAddr {
        TextAddr {
            addr: addr.ip().to_string(),
            port: addr.port().to_string(),
        }
    }
}

impl fmt::Display for TextAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// A resolved address in a fixed-size opaque form, comparing bit-for-bit and
/// usable as a table key. Byte 0 is a layout version tag, byte 1 the length
/// of the encoded socket address; the rest of the layout is private.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct RawAddr {
    data: [u8; 32],
}

impl RawAddr {
    const VERSION: u8 = 1;

    const V4_LEN: u8 = 7;
    const V6_LEN: u8 = 19;

    /// Resolves a textual address, blocking on the system name service.
    /// IPv4 results are preferred when the name yields both families.
    pub fn resolve(text: &TextAddr) -> Result<RawAddr> {
        if text.addr.len() > MAX_HOST_LEN || text.port.len() > MAX_PORT_LEN {
            return Err(Error::Address);
        }

        let port: u16 = match text.port.is_empty() {
            true => DEFAULT_PORT,
            false => text.port.parse().map_err(|_| Error::Address)?,
        };

        // Colon-hex hosts need brackets for the lookup API.
        let target = match text.addr.contains(':') {
            true => format!("[{}]:{}", text.addr, port),
            false => format!("{}:{}", text.addr, port),
        };

        let resolved: Vec<SocketAddr> = target
            .to_socket_addrs()
            .map_err(|_| Error::Address)?
            .collect();

        let chosen = resolved
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| resolved.first())
            .ok_or(Error::Address)?;

        Ok(RawAddr::from_socket_addr(chosen))
    }

    /// Encodes a socket address into the opaque form.
    pub fn from_socket_addr(addr: &SocketAddr) -> RawAddr {
        let mut data = [0u8; 32];
        data[0] = Self::VERSION;

        match addr {
            SocketAddr::V4(v4) => {
                data[1] = Self::V4_LEN;
                data[2] = 4;
                LittleEndian::write_u16(&mut data[3..5], addr.port());
                data[5..9].copy_from_slice(&v4.ip().octets());
            }
            SocketAddr::V6(v6) => {
                data[1] = Self::V6_LEN;
                data[2] = 6;
                LittleEndian::write_u16(&mut data[3..5], addr.port());
                data[5..21].copy_from_slice(&v6.ip().octets());
            }
        }

        RawAddr { data }
    }

    /// Decodes back into a socket address. Fails on a foreign layout
    /// version or a corrupt encoding.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        if self.data[0] != Self::VERSION {
            return Err(Error::Address);
        }

        let port = LittleEndian::read_u16(&self.data[3..5]);

        match (self.data[1], self.data[2]) {
            (Self::V4_LEN, 4) => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.data[5..9]);
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            (Self::V6_LEN, 6) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.data[5..21]);
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => Err(Error::Address),
        }
    }
}

impl fmt::Debug for RawAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let used = 2 + self.data[1] as usize;
        write!(f, "RawAddr(")?;
        for byte in &self.data[..used.min(self.data.len())] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Picks the local address a server binds to.
pub(crate) fn resolve_interface(interface: Option<&str>, port: u16) -> Result<SocketAddr> {
    match interface {
        Some(host) => RawAddr::resolve(&TextAddr::new(host, &port.to_string()))?.socket_addr(),
        None => Ok(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port,
        )),
    }
}
