//! Type-Length-Value vector of a version 2 header.
//!
//! The codec never interprets TLV values; it only splits and joins the raw
//! vector and enforces entry boundaries. Each entry is `type (1) | length
//! (2, big-endian) | value (length)`.

use crate::Error;

/// A version 2 TLV type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlvKind(pub u8);

impl TlvKind {
    pub const ALPN: TlvKind = TlvKind(0x01);
    pub const AUTHORITY: TlvKind = TlvKind(0x02);
    pub const CRC32C: TlvKind = TlvKind(0x03);
    pub const NOOP: TlvKind = TlvKind(0x04);
    pub const UNIQUE_ID: TlvKind = TlvKind(0x05);
    pub const SSL: TlvKind = TlvKind(0x20);
    pub const SSL_VERSION: TlvKind = TlvKind(0x21);
    pub const SSL_CN: TlvKind = TlvKind(0x22);
    pub const SSL_CIPHER: TlvKind = TlvKind(0x23);
    pub const SSL_SIG_ALG: TlvKind = TlvKind(0x24);
    pub const SSL_KEY_ALG: TlvKind = TlvKind(0x25);
    pub const NETNS: TlvKind = TlvKind(0x30);

    /// True for the types assigned by the protocol specification.
    pub fn registered(self) -> bool {
        matches!(
            self,
            TlvKind::ALPN
                | TlvKind::AUTHORITY
                | TlvKind::CRC32C
                | TlvKind::NOOP
                | TlvKind::UNIQUE_ID
                | TlvKind::SSL
                | TlvKind::SSL_VERSION
                | TlvKind::SSL_CN
                | TlvKind::SSL_CIPHER
                | TlvKind::SSL_SIG_ALG
                | TlvKind::SSL_KEY_ALG
                | TlvKind::NETNS
        )
    }

    /// True for the application-specific range `0xE0..=0xEF`.
    pub fn app(self) -> bool {
        (0xE0..=0xEF).contains(&self.0)
    }

    /// True for the experimental range `0xF0..=0xF7`.
    pub fn experiment(self) -> bool {
        (0xF0..=0xF7).contains(&self.0)
    }

    /// True for the reserved-for-future-use range `0xF8..=0xFF`.
    pub fn future(self) -> bool {
        self.0 >= 0xF8
    }
}

impl From<u8> for TlvKind {
    fn from(b: u8) -> TlvKind {
        TlvKind(b)
    }
}

/// A single uninterpreted Type-Length-Value entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub kind: TlvKind,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(kind: TlvKind, value: impl Into<Vec<u8>>) -> Tlv {
        Tlv {
            kind,
            value: value.into(),
        }
    }

    /// The value as UTF-8 text, for the text-valued kinds (AUTHORITY, NETNS
    /// and the SSL string subtypes).
    pub fn text(&self) -> Result<&str, Error> {
        match self.kind {
            TlvKind::AUTHORITY
            | TlvKind::NETNS
            | TlvKind::SSL_VERSION
            | TlvKind::SSL_CN
            | TlvKind::SSL_CIPHER
            | TlvKind::SSL_SIG_ALG
            | TlvKind::SSL_KEY_ALG => {
                std::str::from_utf8(&self.value).map_err(|_| Error::MalformedTlv)
            }
            _ => Err(Error::IncompatibleTlv),
        }
    }

    /// The CRC32C checksum value, for [`TlvKind::CRC32C`] entries.
    pub fn checksum(&self) -> Result<u32, Error> {
        if self.kind != TlvKind::CRC32C {
            return Err(Error::IncompatibleTlv);
        }
        let bytes: [u8; 4] = self
            .value
            .as_slice()
            .try_into()
            .map_err(|_| Error::MalformedTlv)?;
        Ok(u32::from_be_bytes(bytes))
    }
}

/// Split a raw TLV vector into its entries.
///
/// NOOP padding entries are dropped. Fails with [`Error::TruncatedTlv`] when
/// an entry header or value runs past the end of the vector.
pub fn split_tlvs(raw: &[u8]) -> Result<Vec<Tlv>, Error> {
    let mut tlvs = Vec::new();
    let mut i = 0;
    while i < raw.len() {
        if raw.len() - i < 3 {
            return Err(Error::TruncatedTlv);
        }
        let kind = TlvKind(raw[i]);
        let len = usize::from(u16::from_be_bytes([raw[i + 1], raw[i + 2]]));
        i += 3;
        if i + len > raw.len() {
            return Err(Error::TruncatedTlv);
        }
        if kind != TlvKind::NOOP {
            tlvs.push(Tlv {
                kind,
                value: raw[i..i + len].to_vec(),
            });
        }
        i += len;
    }
    Ok(tlvs)
}

/// Join entries back into a raw TLV vector.
///
/// Fails with [`Error::MalformedTlv`] when a value is longer than 65535
/// bytes and cannot be length-prefixed.
pub fn join_tlvs(tlvs: &[Tlv]) -> Result<Vec<u8>, Error> {
    let mut total = 0;
    for tlv in tlvs {
        if tlv.value.len() > usize::from(u16::MAX) {
            return Err(Error::MalformedTlv);
        }
        total += 3 + tlv.value.len();
    }

    let mut raw = Vec::with_capacity(total);
    for tlv in tlvs {
        raw.push(tlv.kind.0);
        raw.extend_from_slice(&(tlv.value.len() as u16).to_be_bytes());
        raw.extend_from_slice(&tlv.value);
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_join_round_trip() {
        let tlvs = vec![
            Tlv::new(TlvKind::ALPN, &b"h2"[..]),
            Tlv::new(TlvKind::AUTHORITY, &b"example.com"[..]),
            Tlv::new(TlvKind::UNIQUE_ID, &b"\x01\x02\x03"[..]),
        ];
        let raw = join_tlvs(&tlvs).unwrap();
        assert_eq!(split_tlvs(&raw).unwrap(), tlvs);
    }

    #[test]
    fn split_drops_noop() {
        // ALPN "h2", then a 4-byte NOOP pad, then NETNS "blue"
        let mut raw = join_tlvs(&[Tlv::new(TlvKind::ALPN, &b"h2"[..])]).unwrap();
        raw.extend_from_slice(&[0x04, 0x00, 0x04, 0, 0, 0, 0]);
        raw.extend_from_slice(&join_tlvs(&[Tlv::new(TlvKind::NETNS, &b"blue"[..])]).unwrap());

        let tlvs = split_tlvs(&raw).unwrap();
        assert_eq!(tlvs.len(), 2);
        assert_eq!(tlvs[0].kind, TlvKind::ALPN);
        assert_eq!(tlvs[1].kind, TlvKind::NETNS);
    }

    #[test]
    fn split_empty_is_empty() {
        assert_eq!(split_tlvs(&[]).unwrap(), Vec::new());
    }

    #[test]
    fn split_truncated_header_and_value() {
        assert!(matches!(split_tlvs(&[0x01]), Err(Error::TruncatedTlv)));
        assert!(matches!(split_tlvs(&[0x01, 0x00]), Err(Error::TruncatedTlv)));
        // declared length 4, only 2 value bytes present
        assert!(matches!(
            split_tlvs(&[0x01, 0x00, 0x04, b'h', b'2']),
            Err(Error::TruncatedTlv)
        ));
    }

    #[test]
    fn join_rejects_oversized_value() {
        let tlv = Tlv::new(TlvKind::ALPN, vec![0u8; usize::from(u16::MAX) + 1]);
        assert!(matches!(join_tlvs(&[tlv]), Err(Error::MalformedTlv)));

        let max = Tlv::new(TlvKind::ALPN, vec![0u8; usize::from(u16::MAX)]);
        assert!(join_tlvs(&[max]).is_ok());
    }

    #[test]
    fn kind_ranges() {
        assert!(TlvKind::ALPN.registered());
        assert!(TlvKind::NETNS.registered());
        assert!(!TlvKind(0xE0).registered());
        assert!(TlvKind(0xE0).app());
        assert!(TlvKind(0xEF).app());
        assert!(TlvKind(0xF0).experiment());
        assert!(TlvKind(0xF7).experiment());
        assert!(TlvKind(0xF8).future());
        assert!(TlvKind(0xFF).future());
        assert!(!TlvKind(0x50).app());
    }

    #[test]
    fn typed_accessors() {
        let authority = Tlv::new(TlvKind::AUTHORITY, &b"example.com"[..]);
        assert_eq!(authority.text().unwrap(), "example.com");
        assert!(matches!(authority.checksum(), Err(Error::IncompatibleTlv)));

        let crc = Tlv::new(TlvKind::CRC32C, 0xdeadbeefu32.to_be_bytes().to_vec());
        assert_eq!(crc.checksum().unwrap(), 0xdeadbeef);
        assert!(matches!(crc.text(), Err(Error::IncompatibleTlv)));

        let short_crc = Tlv::new(TlvKind::CRC32C, &b"\x01"[..]);
        assert!(matches!(short_crc.checksum(), Err(Error::MalformedTlv)));

        let bad_utf8 = Tlv::new(TlvKind::NETNS, &b"\xff\xfe"[..]);
        assert!(matches!(bad_utf8.text(), Err(Error::MalformedTlv)));
    }
}
