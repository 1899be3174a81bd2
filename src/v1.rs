//! The ASCII (version 1) header form.
//!
//! `"PROXY" SP family SP src_ip SP dst_ip SP src_port SP dst_port CRLF`,
//! with at most 107 bytes up to and including the LF. The `UNKNOWN` family
//! has no address tokens and maps to a LOCAL command over an unspecified
//! transport.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::addr::{Addr, Transport};
use crate::source::{self, ByteSource};
use crate::{Command, Error, ProxyHeader, Version};

pub(crate) const GREETING: &[u8] = b"PROXY ";

/// Longest line the protocol permits, LF included.
const MAX_LINE: usize = 107;

const UNKNOWN_LINE: &[u8] = b"PROXY UNKNOWN\r\n";

pub(crate) fn parse<S: ByteSource + ?Sized>(src: &mut S) -> Result<ProxyHeader, Error> {
    let mut line = source::line_buffer();
    loop {
        let b = src
            .read_byte()
            .map_err(|e| e.stage(Error::CantReadVersion1Header))?;
        line.push(b);
        if b == b'\n' {
            break;
        }
        if line.len() == MAX_LINE {
            return Err(Error::Version1HeaderTooLong);
        }
        if src.available() == Some(0) {
            // The line did not arrive in one buffered batch. A genuinely slow
            // writer is indistinguishable from a byte-at-a-time DoS agent, so
            // give up rather than wait.
            return Err(Error::CantReadVersion1Header);
        }
    }

    if line.len() < 2 || line[line.len() - 2] != b'\r' {
        return Err(Error::LineMustEndWithCrlf);
    }

    let text = std::str::from_utf8(&line[..line.len() - 2])
        .map_err(|_| Error::CantReadAddressFamilyAndProtocol)?;
    let tokens: Vec<&str> = text.split(' ').collect();
    if tokens.len() < 2 || tokens[0] != "PROXY" {
        return Err(Error::CantReadAddressFamilyAndProtocol);
    }

    let transport = match tokens[1] {
        "TCP4" => Transport::Tcp4,
        "TCP6" => Transport::Tcp6,
        // The rest of an UNKNOWN line carries no information.
        "UNKNOWN" => {
            return Ok(ProxyHeader {
                version: Version::V1,
                command: Command::Local,
                transport: Transport::Unspec,
                source: None,
                destination: None,
                raw_tlvs: Vec::new(),
            })
        }
        _ => return Err(Error::CantReadAddressFamilyAndProtocol),
    };

    if tokens.len() != 6 {
        return Err(Error::CantReadAddressFamilyAndProtocol);
    }

    let source_ip = parse_ip(transport, tokens[2])?;
    let dest_ip = parse_ip(transport, tokens[3])?;
    let source_port = parse_port(tokens[4])?;
    let dest_port = parse_port(tokens[5])?;

    Ok(ProxyHeader {
        version: Version::V1,
        // v1 has no command byte; a header that names addresses is a proxied
        // connection.
        command: Command::Proxy,
        transport,
        source: Some(Addr::Inet(SocketAddr::new(source_ip, source_port))),
        destination: Some(Addr::Inet(SocketAddr::new(dest_ip, dest_port))),
        raw_tlvs: Vec::new(),
    })
}

fn parse_ip(transport: Transport, s: &str) -> Result<IpAddr, Error> {
    match transport {
        Transport::Tcp4 => Ipv4Addr::from_str(s)
            .map(IpAddr::V4)
            .map_err(|_| Error::InvalidAddress),
        // IPv4-mapped forms parse as Ipv6Addr and are accepted for TCP6.
        Transport::Tcp6 => Ipv6Addr::from_str(s)
            .map(IpAddr::V6)
            .map_err(|_| Error::InvalidAddress),
        _ => Err(Error::InvalidAddress),
    }
}

fn parse_port(s: &str) -> Result<u16, Error> {
    u16::from_str(s).map_err(|_| Error::InvalidPortNumber)
}

pub(crate) fn format(header: &ProxyHeader) -> Result<Vec<u8>, Error> {
    let (src, dst) = match (header.transport, &header.source, &header.destination) {
        (
            Transport::Tcp4,
            Some(Addr::Inet(s @ SocketAddr::V4(_))),
            Some(Addr::Inet(d @ SocketAddr::V4(_))),
        ) => (*s, *d),
        (
            Transport::Tcp6,
            Some(Addr::Inet(s @ SocketAddr::V6(_))),
            Some(Addr::Inet(d @ SocketAddr::V6(_))),
        ) => (*s, *d),
        (Transport::Tcp4 | Transport::Tcp6, _, _) => return Err(Error::InvalidAddress),
        // Everything else only has the short form.
        _ => return Ok(UNKNOWN_LINE.to_vec()),
    };

    let family = if header.transport == Transport::Tcp4 {
        "TCP4"
    } else {
        "TCP6"
    };
    let source_ip = src.ip().to_string();
    let dest_ip = dst.ip().to_string();
    let source_port = src.port().to_string();
    let dest_port = dst.port().to_string();

    let mut line = String::with_capacity(
        GREETING.len()
            + family.len()
            + source_ip.len()
            + dest_ip.len()
            + source_port.len()
            + dest_port.len()
            + 6,
    );
    line.push_str("PROXY ");
    line.push_str(family);
    line.push(' ');
    line.push_str(&source_ip);
    line.push(' ');
    line.push_str(&dest_ip);
    line.push(' ');
    line.push_str(&source_port);
    line.push(' ');
    line.push_str(&dest_port);
    line.push_str("\r\n");

    Ok(line.into_bytes())
}
