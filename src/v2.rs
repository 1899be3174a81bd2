//! The binary (version 2) header form.
//!
//! A 12-byte signature, a version/command byte, a transport byte, a
//! big-endian payload length, then the fixed address block for the transport
//! family followed by the raw TLV vector.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::addr::{Addr, Transport, UnixAddr, UNIX_PATH_LEN};
use crate::source::ByteSource;
use crate::{Command, Error, ProxyHeader, Version};

pub(crate) const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

const VERSION: u8 = 2;

/// Parse the binary form. The caller has peeked the signature but not
/// consumed anything.
pub(crate) fn parse<S: ByteSource + ?Sized>(src: &mut S) -> Result<ProxyHeader, Error> {
    let mut signature = [0u8; 12];
    src.fill(&mut signature)
        .map_err(|e| e.stage(Error::CantReadProtocolVersionAndCommand))?;
    debug_assert_eq!(signature, SIGNATURE);

    let vc = src
        .read_byte()
        .map_err(|e| e.stage(Error::CantReadProtocolVersionAndCommand))?;
    if vc >> 4 != VERSION {
        return Err(Error::UnsupportedProtocolVersionAndCommand);
    }
    let command = match vc & 0x0F {
        0x00 => Command::Local,
        0x01 => Command::Proxy,
        _ => return Err(Error::UnsupportedProtocolVersionAndCommand),
    };

    let tb = src
        .read_byte()
        .map_err(|e| e.stage(Error::CantReadAddressFamilyAndProtocol))?;
    let transport = Transport::from_byte(tb)?;
    // A header with no endpoint information only makes sense for a
    // connection the proxy opened on its own behalf.
    if transport.is_unspec() && command != Command::Local {
        return Err(Error::UnsupportedAddressFamilyAndProtocol);
    }

    let mut length_bytes = [0u8; 2];
    src.fill(&mut length_bytes)
        .map_err(|e| e.stage(Error::CantReadLength))?;
    let length = usize::from(u16::from_be_bytes(length_bytes));

    if length < transport.address_block_len() {
        return Err(Error::InvalidLength);
    }

    let mut header = ProxyHeader {
        version: Version::V2,
        command,
        transport,
        source: None,
        destination: None,
        raw_tlvs: Vec::new(),
    };

    if length == 0 {
        return Ok(header);
    }

    // The whole payload must be producible before any of it is consumed.
    src.peek(length).map_err(|e| e.stage(Error::InvalidLength))?;

    let mut remaining = length;
    if transport.is_ipv4() {
        let mut block = [0u8; 12];
        src.fill(&mut block).map_err(|e| e.stage(Error::InvalidAddress))?;
        let source_ip = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
        let dest_ip = Ipv4Addr::new(block[4], block[5], block[6], block[7]);
        let source_port = u16::from_be_bytes([block[8], block[9]]);
        let dest_port = u16::from_be_bytes([block[10], block[11]]);
        header.source = Some(Addr::Inet(SocketAddr::new(source_ip.into(), source_port)));
        header.destination = Some(Addr::Inet(SocketAddr::new(dest_ip.into(), dest_port)));
        remaining -= block.len();
    } else if transport.is_ipv6() {
        let mut block = [0u8; 36];
        src.fill(&mut block).map_err(|e| e.stage(Error::InvalidAddress))?;
        let source_ip: [u8; 16] = block[..16].try_into().map_err(|_| Error::InvalidAddress)?;
        let dest_ip: [u8; 16] = block[16..32].try_into().map_err(|_| Error::InvalidAddress)?;
        let source_port = u16::from_be_bytes([block[32], block[33]]);
        let dest_port = u16::from_be_bytes([block[34], block[35]]);
        header.source = Some(Addr::Inet(SocketAddr::new(
            Ipv6Addr::from(source_ip).into(),
            source_port,
        )));
        header.destination = Some(Addr::Inet(SocketAddr::new(
            Ipv6Addr::from(dest_ip).into(),
            dest_port,
        )));
        remaining -= block.len();
    } else if transport.is_unix() {
        let mut source_path = [0u8; UNIX_PATH_LEN];
        let mut dest_path = [0u8; UNIX_PATH_LEN];
        src.fill(&mut source_path)
            .map_err(|e| e.stage(Error::InvalidAddress))?;
        src.fill(&mut dest_path)
            .map_err(|e| e.stage(Error::InvalidAddress))?;
        header.source = Some(Addr::Unix(UnixAddr::from_wire(&source_path)));
        header.destination = Some(Addr::Unix(UnixAddr::from_wire(&dest_path)));
        remaining -= 2 * UNIX_PATH_LEN;
    }
    // UNSPEC with a nonzero length skips straight to the TLV vector.

    if remaining > 0 {
        let mut raw_tlvs = vec![0u8; remaining];
        src.fill(&mut raw_tlvs)
            .map_err(|e| e.stage(Error::InvalidLength))?;
        header.raw_tlvs = raw_tlvs;
    }

    Ok(header)
}

/// Serialize the binary form. The total is computed up front so the output
/// is written into a single exactly-sized buffer.
pub(crate) fn format(header: &ProxyHeader) -> Result<Vec<u8>, Error> {
    let fixed = header.transport.address_block_len();
    let payload = fixed + header.raw_tlvs.len();
    if payload > usize::from(u16::MAX) {
        return Err(Error::Uint16Overflow);
    }

    let mut out = Vec::with_capacity(SIGNATURE.len() + 4 + payload);
    out.extend_from_slice(&SIGNATURE);
    out.push(VERSION << 4 | header.command.byte());
    out.push(header.transport.byte());
    out.extend_from_slice(&(payload as u16).to_be_bytes());

    if header.transport.is_ipv4() {
        let (src, dst) = inet_pair(header)?;
        match (src, dst) {
            (SocketAddr::V4(s), SocketAddr::V4(d)) => {
                out.extend_from_slice(&s.ip().octets());
                out.extend_from_slice(&d.ip().octets());
                out.extend_from_slice(&s.port().to_be_bytes());
                out.extend_from_slice(&d.port().to_be_bytes());
            }
            _ => return Err(Error::InvalidAddress),
        }
    } else if header.transport.is_ipv6() {
        let (src, dst) = inet_pair(header)?;
        match (src, dst) {
            (SocketAddr::V6(s), SocketAddr::V6(d)) => {
                out.extend_from_slice(&s.ip().octets());
                out.extend_from_slice(&d.ip().octets());
                out.extend_from_slice(&s.port().to_be_bytes());
                out.extend_from_slice(&d.port().to_be_bytes());
            }
            _ => return Err(Error::InvalidAddress),
        }
    } else if header.transport.is_unix() {
        let (src, dst) = unix_pair(header)?;
        out.extend_from_slice(&src.to_wire()?);
        out.extend_from_slice(&dst.to_wire()?);
    }

    out.extend_from_slice(&header.raw_tlvs);
    Ok(out)
}

fn inet_pair(header: &ProxyHeader) -> Result<(SocketAddr, SocketAddr), Error> {
    match (&header.source, &header.destination) {
        (Some(Addr::Inet(s)), Some(Addr::Inet(d))) => Ok((*s, *d)),
        _ => Err(Error::InvalidAddress),
    }
}

fn unix_pair(header: &ProxyHeader) -> Result<(&UnixAddr, &UnixAddr), Error> {
    match (&header.source, &header.destination) {
        (Some(Addr::Unix(s)), Some(Addr::Unix(d))) => Ok((s, d)),
        _ => Err(Error::InvalidAddress),
    }
}
