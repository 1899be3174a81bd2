use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Everything that can go wrong while reading, writing or policing a PROXY
/// protocol header.
///
/// The error is cheap to clone: a connection wrapper stores the first failure
/// it encounters and replays it on every subsequent operation, mirroring the
/// permanent-failure semantics of the underlying socket.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The stream does not begin with a recognized PROXY protocol signature,
    /// or the header read timed out before one arrived.
    #[error("proxy protocol: stream does not begin with a proxy protocol header")]
    NoProxyProtocol,

    /// More input is needed before parsing can make progress. Only returned
    /// by the buffer-based [`parse`](crate::ProxyHeader::parse) entry point;
    /// callers accumulating bytes should read more and retry.
    #[error("proxy protocol: buffer too short to hold a complete header")]
    BufferTooShort,

    /// A version 1 header line could not be read from the stream.
    #[error("proxy protocol: failed to read version 1 header")]
    CantReadVersion1Header,

    /// No LF was found within the first 107 bytes of a version 1 line.
    #[error("proxy protocol: version 1 header missing delimiter in first 107 bytes")]
    Version1HeaderTooLong,

    /// The version 1 line was not terminated by CRLF.
    #[error("proxy protocol: version 1 header must end with CRLF")]
    LineMustEndWithCrlf,

    /// The version 2 signature or version/command byte could not be read.
    #[error("proxy protocol: failed to read protocol version and command")]
    CantReadProtocolVersionAndCommand,

    /// The address family and protocol could not be read or tokenized.
    #[error("proxy protocol: failed to read address family and protocol")]
    CantReadAddressFamilyAndProtocol,

    /// The version/command byte named an unknown version or command.
    #[error("proxy protocol: unsupported protocol version and command")]
    UnsupportedProtocolVersionAndCommand,

    /// The transport byte named an unknown family/protocol combination, or
    /// UNSPEC was used with a command other than LOCAL.
    #[error("proxy protocol: unsupported address family and protocol")]
    UnsupportedAddressFamilyAndProtocol,

    /// The version 2 length field could not be read.
    #[error("proxy protocol: failed to read length")]
    CantReadLength,

    /// The version 2 length field is below the family minimum, or the stream
    /// cannot produce the declared number of payload bytes.
    #[error("proxy protocol: invalid length")]
    InvalidLength,

    /// An address could not be parsed, or does not fit the header transport.
    #[error("proxy protocol: invalid address")]
    InvalidAddress,

    /// A port token is not a decimal integer in `0..=65535`.
    #[error("proxy protocol: invalid port number")]
    InvalidPortNumber,

    /// A TLV entry header or value ran past the end of the vector.
    #[error("proxy protocol: truncated TLV")]
    TruncatedTlv,

    /// A TLV value is too long to be length-prefixed with 16 bits.
    #[error("proxy protocol: malformed TLV value")]
    MalformedTlv,

    /// A typed accessor was applied to a TLV of a different kind or shape.
    #[error("proxy protocol: incompatible TLV type")]
    IncompatibleTlv,

    /// The fixed address block plus the TLV vector exceeds 65535 bytes.
    #[error("proxy protocol: header length overflows a u16")]
    Uint16Overflow,

    /// A header was received on a connection whose policy is
    /// [`Reject`](crate::Policy::Reject).
    #[error("proxy protocol: superfluous proxy header")]
    SuperfluousProxyHeader,

    /// The policy function deemed the upstream untrusted. The listener
    /// adapter consumes this kind: it closes the connection and keeps
    /// accepting instead of surfacing an error.
    #[error("proxy protocol: upstream connection address not trusted for PROXY information")]
    InvalidUpstream,

    /// An I/O failure while reading or writing a header.
    #[error("proxy protocol: i/o failure: {0}")]
    Io(Arc<io::Error>),
}

impl Error {
    /// True when more input may turn this error into a successful parse.
    ///
    /// Only [`Error::BufferTooShort`] qualifies; every other kind is a
    /// verdict on input already seen.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::BufferTooShort)
    }

    /// True when this error carries an I/O timeout.
    pub(crate) fn is_timeout(&self) -> bool {
        match self {
            Error::Io(e) => matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
            _ => false,
        }
    }

    /// Replace this error with a stage-specific kind, keeping the two shapes
    /// that must survive unmapped: `BufferTooShort` (the accumulate-and-retry
    /// signal) and timeout I/O errors (translated to [`Error::NoProxyProtocol`]
    /// by the connection wrapper).
    pub(crate) fn stage(self, stage: Error) -> Error {
        if self.is_incomplete() || self.is_timeout() {
            self
        } else {
            stage
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match &e {
            Error::Io(inner) => io::Error::new(inner.kind(), e.clone()),
            _ => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}
