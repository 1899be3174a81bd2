//! PROXY protocol codec and connection interception.
//!
//! This crate implements both sides of the
//! [PROXY protocol](https://www.haproxy.org/download/2.8/doc/proxy-protocol.txt),
//! the mechanism by which a transport-layer proxy (HAProxy, Amazon ELB and
//! many others) forwards the original client's endpoint information to a
//! back-end server ahead of the payload bytes:
//!
//! - a codec for the version 1 (ASCII) and version 2 (binary, with TLV
//!   extensions) header forms,
//! - [`ProxyConn`], a wrapper around an accepted stream that reads the
//!   header exactly once before any payload byte and then reports the
//!   client's addresses as its own,
//! - [`ProxyListener`], an accept adapter that applies a per-connection
//!   [`Policy`] decided from the peer address,
//! - with the `tokio` feature, async counterparts in the [`io`] module.
//!
//! # Parsing
//!
//! [`ProxyHeader::parse`] decodes a header from a buffer, returning the
//! header and the number of bytes it occupied:
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use proxy_wire::ProxyHeader;
//!
//! let buf = b"PROXY TCP4 10.0.0.1 192.168.0.1 56324 443\r\nGET /\r\n";
//! let (header, len) = ProxyHeader::parse(buf)?;
//!
//! assert_eq!(header.source, Some("10.0.0.1:56324".parse::<std::net::SocketAddr>()?.into()));
//! assert_eq!(&buf[len..], b"GET /\r\n");
//! # Ok(())
//! # }
//! ```
//!
//! An [`Error::BufferTooShort`] result means the buffer holds a valid but
//! incomplete header; read more bytes and try again.
//!
//! # Emitting
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use proxy_wire::{ProxyHeader, Version};
//!
//! let header = ProxyHeader::proxy_from_addrs(
//!     Version::V2,
//!     "10.0.0.1:56324".parse()?,
//!     "192.168.0.1:443".parse()?,
//! );
//!
//! let mut out = Vec::new();
//! let written = header.write_to(&mut out)?;
//! assert_eq!(written, 28);
//! # Ok(())
//! # }
//! ```
//!
//! # Intercepting connections
//!
//! ```no_run
//! use proxy_wire::{Policy, ProxyListener};
//! use std::io::Read;
//! use std::net::TcpListener;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = ProxyListener::new(TcpListener::bind("[::]:9000")?)
//!         .with_policy(|_ctx| Ok(Policy::Use));
//!
//!     loop {
//!         let mut conn = listener.accept()?;
//!         // The first read consumes the header; the addresses reported from
//!         // here on are the ones the proxy saw.
//!         println!("client: {}", conn.remote_addr()?);
//!         let mut buf = [0u8; 1024];
//!         let n = conn.read(&mut buf)?;
//!         println!("first {n} payload bytes: {:?}", &buf[..n]);
//!     }
//! }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

mod addr;
mod conn;
mod error;
mod listener;
mod policy;
mod source;
mod tlv;
mod v1;
mod v2;

#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
pub mod io;

use std::io::Write;
use std::net::SocketAddr;

pub use addr::{Addr, Transport, UnixAddr, UNIX_PATH_LEN};
pub use conn::{Forwarder, NetStream, ProxyConn};
pub use error::Error;
pub use listener::{Listen, ProxyListener};
pub use policy::{Policy, PolicyContext, DEFAULT_READ_HEADER_TIMEOUT};
pub use source::{ByteSource, SourceBuffer};
pub use tlv::{join_tlvs, split_tlvs, Tlv, TlvKind};

use source::SliceSource;

/// PROXY protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    /// The ASCII form.
    V1,
    /// The binary form.
    V2,
}

/// The command byte of a version 2 header.
///
/// Version 1 has no command; parsing synthesizes [`Command::Local`] for
/// `UNKNOWN` lines and [`Command::Proxy`] otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// The connection was opened by the proxy itself (health checks and the
    /// like); the header carries no usable endpoints.
    Local,
    /// The connection is relayed on behalf of the addressed client.
    Proxy,
}

impl Command {
    pub fn is_local(self) -> bool {
        self == Command::Local
    }

    pub(crate) fn byte(self) -> u8 {
        match self {
            Command::Local => 0x00,
            Command::Proxy => 0x01,
        }
    }
}

/// A parsed or constructed PROXY protocol header.
///
/// Headers come from two places: [`ProxyHeader::read`]/[`ProxyHeader::parse`]
/// on the receiving side, or one of the constructors on the emitting side.
/// Once built a header is a plain value; formatting does not mutate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: Version,
    pub command: Command,
    pub transport: Transport,
    /// The originating client endpoint, absent for UNSPEC transports.
    pub source: Option<Addr>,
    /// The endpoint the client connected to, absent for UNSPEC transports.
    pub destination: Option<Addr>,
    /// The version 2 TLV vector, verbatim. Never interpreted by the codec
    /// beyond boundary checks.
    raw_tlvs: Vec<u8>,
}

impl Default for ProxyHeader {
    fn default() -> ProxyHeader {
        ProxyHeader::local()
    }
}

impl ProxyHeader {
    /// A version 2 LOCAL header: no endpoint information.
    pub fn local() -> ProxyHeader {
        ProxyHeader {
            version: Version::V2,
            command: Command::Local,
            transport: Transport::Unspec,
            source: None,
            destination: None,
            raw_tlvs: Vec::new(),
        }
    }

    /// A version 2 PROXY header with the given endpoints.
    pub fn proxy(transport: Transport, source: Addr, destination: Addr) -> ProxyHeader {
        ProxyHeader {
            version: Version::V2,
            command: Command::Proxy,
            transport,
            source: Some(source),
            destination: Some(destination),
            raw_tlvs: Vec::new(),
        }
    }

    /// A PROXY header for a pair of socket addresses, inferring the
    /// transport from their family. Falls back to a LOCAL header when the
    /// families do not match.
    pub fn proxy_from_addrs(
        version: Version,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> ProxyHeader {
        let transport = match (source, destination) {
            (SocketAddr::V4(_), SocketAddr::V4(_)) => Transport::Tcp4,
            (SocketAddr::V6(_), SocketAddr::V6(_)) => Transport::Tcp6,
            _ => {
                return ProxyHeader {
                    version,
                    ..ProxyHeader::local()
                }
            }
        };
        ProxyHeader {
            version,
            command: Command::Proxy,
            transport,
            source: Some(Addr::Inet(source)),
            destination: Some(Addr::Inet(destination)),
            raw_tlvs: Vec::new(),
        }
    }

    /// Read a header from a buffered byte source.
    ///
    /// The stream is classified by peeking: a `"PROXY "` prefix selects the
    /// version 1 parser, the 12-byte binary signature selects version 2, and
    /// anything else fails with [`Error::NoProxyProtocol`] *without
    /// consuming anything*; the next reader still observes the same bytes.
    pub fn read<S: ByteSource + ?Sized>(src: &mut S) -> Result<ProxyHeader, Error> {
        let first = src.peek(1).map_err(|e| e.stage(Error::NoProxyProtocol))?[0];
        match first {
            b'P' => {
                let greeting = src
                    .peek(v1::GREETING.len())
                    .map_err(|e| e.stage(Error::NoProxyProtocol))?;
                if greeting == v1::GREETING {
                    v1::parse(src)
                } else {
                    Err(Error::NoProxyProtocol)
                }
            }
            b'\r' => {
                let signature = src
                    .peek(v2::SIGNATURE.len())
                    .map_err(|e| e.stage(Error::NoProxyProtocol))?;
                if signature == v2::SIGNATURE.as_slice() {
                    v2::parse(src)
                } else {
                    Err(Error::NoProxyProtocol)
                }
            }
            _ => Err(Error::NoProxyProtocol),
        }
    }

    /// Parse a header from the front of a buffer.
    ///
    /// Returns the header and the number of bytes consumed. Fails with
    /// [`Error::BufferTooShort`] when the buffer holds a valid but
    /// incomplete header, so a caller accumulating from a socket can read
    /// more and retry.
    pub fn parse(buf: &[u8]) -> Result<(ProxyHeader, usize), Error> {
        let mut src = SliceSource::new(buf);
        let header = ProxyHeader::read(&mut src)?;
        Ok((header, src.consumed()))
    }

    /// Format the header according to its version.
    pub fn format(&self) -> Result<Vec<u8>, Error> {
        match self.version {
            Version::V1 => v1::format(self),
            Version::V2 => v2::format(self),
        }
    }

    /// Format the header and write it to `w` in a single call, returning the
    /// number of bytes written.
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, Error> {
        let bytes = self.format()?;
        w.write_all(&bytes)?;
        Ok(bytes.len())
    }

    /// The raw TLV vector, exactly as received or as it will be emitted.
    pub fn raw_tlvs(&self) -> &[u8] {
        &self.raw_tlvs
    }

    /// Split the TLV vector into entries. NOOP padding is dropped.
    pub fn tlvs(&self) -> Result<Vec<Tlv>, Error> {
        split_tlvs(&self.raw_tlvs)
    }

    /// Replace the TLV vector. Only version 2 headers carry TLVs on the
    /// wire; version 1 formatting ignores them.
    pub fn set_tlvs(&mut self, tlvs: &[Tlv]) -> Result<(), Error> {
        self.raw_tlvs = join_tlvs(tlvs)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    const V1_TCP4: &[u8] = b"PROXY TCP4 10.1.1.1 20.2.2.2 1000 2000\r\n";
    const V1_UNKNOWN: &[u8] = b"PROXY UNKNOWN\r\n";

    fn v2_local() -> Vec<u8> {
        let mut out = v2::SIGNATURE.to_vec();
        out.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);
        out
    }

    fn v2_tcp4_tlv() -> Vec<u8> {
        let mut out = v2::SIGNATURE.to_vec();
        out.push(0x21);
        out.push(0x11);
        out.extend_from_slice(&18u16.to_be_bytes());
        out.extend_from_slice(&[0x0A, 0x00, 0x00, 0x01, 0xC0, 0xA8, 0x00, 0x01]);
        out.extend_from_slice(&[0x04, 0xD2, 0x00, 0x50]);
        out.extend_from_slice(&[0x01, 0x00, 0x03, b'h', b'2', 0x00]);
        out
    }

    #[test]
    fn every_prefix_is_too_short() {
        let cases: Vec<Vec<u8>> = vec![
            V1_TCP4.to_vec(),
            V1_UNKNOWN.to_vec(),
            v2_local(),
            v2_tcp4_tlv(),
        ];
        for case in cases {
            for i in 0..case.len() {
                assert!(
                    matches!(ProxyHeader::parse(&case[..i]), Err(Error::BufferTooShort)),
                    "prefix of {i} bytes should be too short"
                );
            }
            let (_, consumed) = ProxyHeader::parse(&case).unwrap();
            assert_eq!(consumed, case.len());
        }
    }

    #[test]
    fn payload_is_not_consumed() {
        let mut buf = v2_tcp4_tlv();
        buf.extend_from_slice(b"HELO");
        let (header, consumed) = ProxyHeader::parse(&buf).unwrap();
        assert_eq!(&buf[consumed..], b"HELO");
        assert_eq!(header.transport, Transport::Tcp4);
        assert_eq!(header.raw_tlvs().len(), 6);
    }

    #[test]
    fn garbage_is_not_proxy_protocol() {
        for case in [
            &b"GET / HTTP/1.1\r\n"[..],
            b"PROXZ TCP4 1.2.3.4 5.6.7.8 1 2\r\n",
            b"\r\nnot a signature!",
            b"\x16\x03\x01\x02\x00tls client hello",
        ] {
            assert!(
                matches!(ProxyHeader::parse(case), Err(Error::NoProxyProtocol)),
                "{case:?}"
            );
        }
    }

    #[test]
    fn failed_classification_leaves_stream_intact() {
        let payload = b"SSH-2.0-OpenSSH_9.6\r\n";
        let mut src = SourceBuffer::new(&payload[..]);
        assert!(matches!(
            ProxyHeader::read(&mut src),
            Err(Error::NoProxyProtocol)
        ));

        let mut rest = Vec::new();
        src.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, payload);
    }

    #[test]
    fn read_from_stream_leaves_payload() {
        let mut buf = V1_TCP4.to_vec();
        buf.extend_from_slice(b"HELO");
        let mut src = SourceBuffer::new(buf.as_slice());

        let header = ProxyHeader::read(&mut src).unwrap();
        assert_eq!(header.version, Version::V1);

        let mut rest = Vec::new();
        src.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"HELO");
    }

    #[test]
    fn trickled_v1_line_is_rejected() {
        // One byte per read: the line never arrives in a single buffered
        // batch, which the v1 parser treats as a slow-writer attack.
        struct Trickle<'a>(&'a [u8]);
        impl Read for Trickle<'_> {
            fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
                match self.0.split_first() {
                    Some((&b, rest)) if !out.is_empty() => {
                        out[0] = b;
                        self.0 = rest;
                        Ok(1)
                    }
                    _ => Ok(0),
                }
            }
        }

        let mut src = SourceBuffer::new(Trickle(V1_TCP4));
        assert!(matches!(
            ProxyHeader::read(&mut src),
            Err(Error::CantReadVersion1Header)
        ));
    }

    #[test]
    fn format_round_trips_both_versions() {
        let v1_header = ProxyHeader::proxy_from_addrs(
            Version::V1,
            "10.1.1.1:1000".parse().unwrap(),
            "20.2.2.2:2000".parse().unwrap(),
        );
        let bytes = v1_header.format().unwrap();
        let (parsed, consumed) = ProxyHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, v1_header);
        assert_eq!(consumed, bytes.len());

        let mut v2_header = ProxyHeader::proxy(
            Transport::Tcp6,
            Addr::Inet("[2001:db8::1]:51234".parse().unwrap()),
            Addr::Inet("[::1]:443".parse().unwrap()),
        );
        v2_header
            .set_tlvs(&[Tlv::new(TlvKind::AUTHORITY, &b"example.com"[..])])
            .unwrap();
        let bytes = v2_header.format().unwrap();
        let (parsed, consumed) = ProxyHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, v2_header);
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.tlvs().unwrap()[0].text().unwrap(), "example.com");
    }

    #[test]
    fn write_to_reports_length() {
        let header = ProxyHeader::local();
        let mut out = Vec::new();
        let n = header.write_to(&mut out).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(n, 16);

        let unknown = ProxyHeader {
            version: Version::V1,
            ..ProxyHeader::local()
        };
        let mut out = Vec::new();
        assert_eq!(unknown.write_to(&mut out).unwrap(), 15);
        assert_eq!(out, b"PROXY UNKNOWN\r\n");
    }

    #[test]
    fn proxy_from_addrs_infers_transport() {
        let v4 = ProxyHeader::proxy_from_addrs(
            Version::V2,
            "1.2.3.4:1".parse().unwrap(),
            "5.6.7.8:2".parse().unwrap(),
        );
        assert_eq!(v4.transport, Transport::Tcp4);
        assert_eq!(v4.command, Command::Proxy);

        let v6 = ProxyHeader::proxy_from_addrs(
            Version::V2,
            "[::1]:1".parse().unwrap(),
            "[::2]:2".parse().unwrap(),
        );
        assert_eq!(v6.transport, Transport::Tcp6);

        let mixed = ProxyHeader::proxy_from_addrs(
            Version::V2,
            "1.2.3.4:1".parse().unwrap(),
            "[::2]:2".parse().unwrap(),
        );
        assert_eq!(mixed.command, Command::Local);
        assert_eq!(mixed.transport, Transport::Unspec);
    }
}
