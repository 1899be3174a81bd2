//! Address family, transport protocol and endpoint types.
//!
//! A version 2 header packs the address family into the upper nibble and the
//! transport protocol into the lower nibble of a single byte. In memory the
//! pair is a closed set of variants; [`Transport::from_byte`] and
//! [`Transport::byte`] are the only places the packed form appears.

use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
#[cfg(unix)]
use std::path::Path;

use crate::Error;

const AF_UNSPEC: u8 = 0x00;
const AF_INET: u8 = 0x10;
const AF_INET6: u8 = 0x20;
const AF_UNIX: u8 = 0x30;

const PROTO_UNSPEC: u8 = 0x00;
const PROTO_STREAM: u8 = 0x01;
const PROTO_DGRAM: u8 = 0x02;

/// Maximum length of a Unix socket path carried in a version 2 header.
pub const UNIX_PATH_LEN: usize = 108;

/// Address family and transport protocol of a proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// No endpoint information is carried.
    Unspec,
    /// TCP over IPv4.
    Tcp4,
    /// UDP over IPv4.
    Udp4,
    /// TCP over IPv6.
    Tcp6,
    /// UDP over IPv6.
    Udp6,
    /// `SOCK_STREAM` over `AF_UNIX`.
    UnixStream,
    /// `SOCK_DGRAM` over `AF_UNIX`.
    UnixDatagram,
}

impl Transport {
    /// Decode the packed family/protocol byte of a version 2 header.
    pub fn from_byte(b: u8) -> Result<Transport, Error> {
        match b {
            b if b == AF_UNSPEC | PROTO_UNSPEC => Ok(Transport::Unspec),
            b if b == AF_INET | PROTO_STREAM => Ok(Transport::Tcp4),
            b if b == AF_INET | PROTO_DGRAM => Ok(Transport::Udp4),
            b if b == AF_INET6 | PROTO_STREAM => Ok(Transport::Tcp6),
            b if b == AF_INET6 | PROTO_DGRAM => Ok(Transport::Udp6),
            b if b == AF_UNIX | PROTO_STREAM => Ok(Transport::UnixStream),
            b if b == AF_UNIX | PROTO_DGRAM => Ok(Transport::UnixDatagram),
            _ => Err(Error::UnsupportedAddressFamilyAndProtocol),
        }
    }

    /// Encode as the packed family/protocol byte of a version 2 header.
    pub fn byte(self) -> u8 {
        match self {
            Transport::Unspec => AF_UNSPEC | PROTO_UNSPEC,
            Transport::Tcp4 => AF_INET | PROTO_STREAM,
            Transport::Udp4 => AF_INET | PROTO_DGRAM,
            Transport::Tcp6 => AF_INET6 | PROTO_STREAM,
            Transport::Udp6 => AF_INET6 | PROTO_DGRAM,
            Transport::UnixStream => AF_UNIX | PROTO_STREAM,
            Transport::UnixDatagram => AF_UNIX | PROTO_DGRAM,
        }
    }

    pub fn is_unspec(self) -> bool {
        self == Transport::Unspec
    }

    pub fn is_ipv4(self) -> bool {
        matches!(self, Transport::Tcp4 | Transport::Udp4)
    }

    pub fn is_ipv6(self) -> bool {
        matches!(self, Transport::Tcp6 | Transport::Udp6)
    }

    pub fn is_unix(self) -> bool {
        matches!(self, Transport::UnixStream | Transport::UnixDatagram)
    }

    pub fn is_stream(self) -> bool {
        matches!(
            self,
            Transport::Tcp4 | Transport::Tcp6 | Transport::UnixStream
        )
    }

    pub fn is_datagram(self) -> bool {
        matches!(
            self,
            Transport::Udp4 | Transport::Udp6 | Transport::UnixDatagram
        )
    }

    /// Size of the fixed address/port block in a version 2 payload.
    pub(crate) fn address_block_len(self) -> usize {
        if self.is_ipv4() {
            12
        } else if self.is_ipv6() {
            36
        } else if self.is_unix() {
            2 * UNIX_PATH_LEN
        } else {
            0
        }
    }
}

/// A Unix socket endpoint as carried on the wire.
///
/// The wire form is a 108-byte NUL-padded field; the in-memory form keeps
/// only the bytes before the first NUL. Paths are raw bytes, not UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct UnixAddr {
    name: Vec<u8>,
}

impl UnixAddr {
    /// An endpoint from path bytes. Validity (length) is checked when the
    /// header is formatted, not here.
    pub fn new(name: impl Into<Vec<u8>>) -> UnixAddr {
        UnixAddr { name: name.into() }
    }

    /// Extract an endpoint from a NUL-padded wire field.
    pub(crate) fn from_wire(field: &[u8]) -> UnixAddr {
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        UnixAddr {
            name: field[..end].to_vec(),
        }
    }

    /// NUL-pad into a 108-byte wire field. Fails when the path does not fit.
    pub(crate) fn to_wire(&self) -> Result<[u8; UNIX_PATH_LEN], Error> {
        if self.name.len() > UNIX_PATH_LEN {
            return Err(Error::InvalidAddress);
        }
        let mut field = [0u8; UNIX_PATH_LEN];
        field[..self.name.len()].copy_from_slice(&self.name);
        Ok(field)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.name
    }

    /// True for the anonymous (zero-length) endpoint.
    pub fn is_unnamed(&self) -> bool {
        self.name.is_empty()
    }

    #[cfg(unix)]
    pub fn as_path(&self) -> &Path {
        Path::new(std::ffi::OsStr::from_bytes(&self.name))
    }
}

#[cfg(unix)]
impl From<&Path> for UnixAddr {
    fn from(p: &Path) -> UnixAddr {
        UnixAddr::new(p.as_os_str().as_bytes())
    }
}

impl fmt::Display for UnixAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unnamed() {
            write!(f, "(unnamed)")
        } else {
            write!(f, "{}", String::from_utf8_lossy(&self.name))
        }
    }
}

/// One endpoint of a proxied connection, IP or Unix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Addr {
    /// An IPv4 or IPv6 socket address.
    Inet(SocketAddr),
    /// A Unix socket path.
    Unix(UnixAddr),
}

impl Addr {
    /// The IP socket address, if this is an IP endpoint.
    pub fn inet(&self) -> Option<SocketAddr> {
        match self {
            Addr::Inet(sa) => Some(*sa),
            Addr::Unix(_) => None,
        }
    }

    /// The Unix endpoint, if this is one.
    pub fn unix(&self) -> Option<&UnixAddr> {
        match self {
            Addr::Inet(_) => None,
            Addr::Unix(ua) => Some(ua),
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(sa: SocketAddr) -> Addr {
        Addr::Inet(sa)
    }
}

impl From<UnixAddr> for Addr {
    fn from(ua: UnixAddr) -> Addr {
        Addr::Unix(ua)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Inet(sa) => write!(f, "{sa}"),
            Addr::Unix(ua) => write!(f, "{ua}"),
        }
    }
}
