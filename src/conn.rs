//! The interception wrapper around an accepted connection.
//!
//! [`ProxyConn`] defers the header read until the first payload read or
//! address query, performs it exactly once, and from then on either serves
//! the header-derived addresses or falls back to the socket's own. A parse
//! failure is permanent: every subsequent operation returns the stored
//! error.

use std::io::{self, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::addr::Addr;
#[cfg(unix)]
use crate::addr::UnixAddr;
use crate::policy::{resolve_timeout, Policy, ValidatorFn};
use crate::source::SourceBuffer;
use crate::{Error, ProxyHeader};

/// The connection surface the wrapper needs from an accepted stream:
/// reading, writing, the two endpoint addresses, and read/write timeouts
/// (the header-read deadline is implemented as a transient read timeout).
pub trait NetStream: Read + Write {
    fn local_addr(&self) -> io::Result<Addr>;
    fn peer_addr(&self) -> io::Result<Addr>;
    fn read_timeout(&self) -> io::Result<Option<Duration>>;
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl NetStream for TcpStream {
    fn local_addr(&self) -> io::Result<Addr> {
        TcpStream::local_addr(self).map(Addr::Inet)
    }

    fn peer_addr(&self) -> io::Result<Addr> {
        TcpStream::peer_addr(self).map(Addr::Inet)
    }

    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        TcpStream::read_timeout(self)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

#[cfg(unix)]
fn unix_addr(addr: std::os::unix::net::SocketAddr) -> Addr {
    match addr.as_pathname() {
        Some(path) => Addr::Unix(path.into()),
        None => Addr::Unix(UnixAddr::default()),
    }
}

#[cfg(unix)]
impl NetStream for UnixStream {
    fn local_addr(&self) -> io::Result<Addr> {
        UnixStream::local_addr(self).map(unix_addr)
    }

    fn peer_addr(&self) -> io::Result<Addr> {
        UnixStream::peer_addr(self).map(unix_addr)
    }

    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        UnixStream::read_timeout(self)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_write_timeout(self, timeout)
    }
}

/// An accelerated copy hook: `(source, sink, scratch)` to bytes copied.
///
/// [`ProxyConn::write_to`] and [`ProxyConn::read_from`] use it once the
/// read-ahead buffer has been drained; without one they fall back to a
/// plain buffered copy.
pub type Forwarder = fn(&mut dyn Read, &mut dyn Write, &mut [u8]) -> io::Result<u64>;

enum HeaderState {
    Fresh,
    HeaderRead(ProxyHeader),
    Bypass,
    Failed(Error),
}

/// A stream that may begin with a PROXY protocol header.
///
/// The header is read lazily, at most once, on the first of `read`,
/// [`proxy_header`](ProxyConn::proxy_header),
/// [`local_addr`](ProxyConn::local_addr) or
/// [`remote_addr`](ProxyConn::remote_addr); exclusive access (`&mut self`)
/// makes the transition single-shot. Writes and timeout changes delegate to
/// the underlying stream untouched. Dropping the wrapper closes the stream
/// and returns its read-ahead buffer to the internal pool.
pub struct ProxyConn<S: NetStream> {
    source: SourceBuffer<S>,
    policy: Policy,
    validator: Option<Arc<ValidatorFn>>,
    read_header_timeout: Option<Duration>,
    forwarder: Option<Forwarder>,
    state: HeaderState,
}

impl<S: NetStream> ProxyConn<S> {
    /// Wrap an accepted stream. No header-read timeout is armed; see
    /// [`with_read_header_timeout`](ProxyConn::with_read_header_timeout).
    pub fn new(stream: S, policy: Policy) -> ProxyConn<S> {
        ProxyConn {
            source: SourceBuffer::new(stream),
            policy,
            validator: None,
            read_header_timeout: None,
            forwarder: None,
            state: HeaderState::Fresh,
        }
    }

    /// Bound the header read with a transient read deadline. `None` disables
    /// the bound, a zero duration selects
    /// [`DEFAULT_READ_HEADER_TIMEOUT`](crate::DEFAULT_READ_HEADER_TIMEOUT).
    pub fn with_read_header_timeout(mut self, timeout: Option<Duration>) -> ProxyConn<S> {
        self.read_header_timeout = resolve_timeout(timeout);
        self
    }

    /// Run `validate` over a successfully parsed header before accepting it.
    pub fn with_validator(
        mut self,
        validate: impl Fn(&ProxyHeader) -> Result<(), Error> + Send + Sync + 'static,
    ) -> ProxyConn<S> {
        self.validator = Some(Arc::new(validate));
        self
    }

    pub(crate) fn with_shared_validator(mut self, validate: Arc<ValidatorFn>) -> ProxyConn<S> {
        self.validator = Some(validate);
        self
    }

    /// Install an accelerated copy hook for
    /// [`write_to`](ProxyConn::write_to) / [`read_from`](ProxyConn::read_from).
    pub fn with_forwarder(mut self, forwarder: Forwarder) -> ProxyConn<S> {
        self.forwarder = Some(forwarder);
        self
    }

    /// The parsed header, reading it first if this connection has not been
    /// touched yet. `Ok(None)` means the connection is a plain stream (no
    /// header, or policy [`Ignore`](Policy::Ignore)/[`Skip`](Policy::Skip)).
    pub fn proxy_header(&mut self) -> Result<Option<&ProxyHeader>, Error> {
        self.attempt();
        match &self.state {
            HeaderState::HeaderRead(header) => Ok(Some(header)),
            HeaderState::Bypass | HeaderState::Fresh => Ok(None),
            HeaderState::Failed(e) => Err(e.clone()),
        }
    }

    /// The perceived local address: the header's destination when a header
    /// with a PROXY command was read, the socket's own address otherwise.
    /// After a failed header read this returns the stored error, like every
    /// other operation on the wrapper.
    pub fn local_addr(&mut self) -> io::Result<Addr> {
        self.attempt();
        match &self.state {
            HeaderState::Failed(e) => Err(e.clone().into()),
            HeaderState::HeaderRead(header) if !header.command.is_local() => {
                match &header.destination {
                    Some(addr) => Ok(addr.clone()),
                    None => self.source.get_ref().local_addr(),
                }
            }
            _ => self.source.get_ref().local_addr(),
        }
    }

    /// The perceived peer address: the header's source when a header with a
    /// PROXY command was read, the socket's peer otherwise. After a failed
    /// header read this returns the stored error.
    pub fn remote_addr(&mut self) -> io::Result<Addr> {
        self.attempt();
        match &self.state {
            HeaderState::Failed(e) => Err(e.clone().into()),
            HeaderState::HeaderRead(header) if !header.command.is_local() => {
                match &header.source {
                    Some(addr) => Ok(addr.clone()),
                    None => self.source.get_ref().peer_addr(),
                }
            }
            _ => self.source.get_ref().peer_addr(),
        }
    }

    /// Set a read deadline on the underlying stream for payload reads.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.source.get_ref().set_read_timeout(timeout)
    }

    pub fn read_timeout(&self) -> io::Result<Option<Duration>> {
        self.source.get_ref().read_timeout()
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.source.get_ref().set_write_timeout(timeout)
    }

    /// The underlying stream. Reading from it directly will lose any bytes
    /// already sitting in the read-ahead buffer.
    pub fn get_ref(&self) -> &S {
        self.source.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.source.get_mut()
    }

    /// Discard the wrapper, returning the underlying stream. Buffered
    /// payload bytes are lost; prefer draining with `read` first.
    pub fn into_inner(self) -> S {
        self.source.into_inner()
    }

    /// Copy the remaining payload into `dst` until end of stream, returning
    /// the number of bytes copied. The read-ahead buffer is drained first;
    /// an installed [`Forwarder`] handles the rest.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> io::Result<u64> {
        self.attempt();
        if let HeaderState::Failed(e) = &self.state {
            return Err(e.clone().into());
        }

        let mut total = 0u64;
        if let Some(forward) = self.forwarder {
            let mut scratch = vec![0u8; 8192];
            while self.source.buffered() > 0 {
                let n = self.source.read(&mut scratch)?;
                dst.write_all(&scratch[..n])?;
                total += n as u64;
            }
            return Ok(total + forward(self.source.get_mut(), dst, &mut scratch)?);
        }
        Ok(total + io::copy(&mut self.source, dst)?)
    }

    /// Copy `src` into this connection until end of stream, returning the
    /// number of bytes copied.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<u64> {
        if let Some(forward) = self.forwarder {
            let mut scratch = vec![0u8; 8192];
            return forward(src, self.source.get_mut(), &mut scratch);
        }
        io::copy(src, self.source.get_mut())
    }

    fn attempt(&mut self) {
        if !matches!(self.state, HeaderState::Fresh) {
            return;
        }
        if self.policy == Policy::Skip {
            self.state = HeaderState::Bypass;
            return;
        }
        self.state = self.read_header();
    }

    fn read_header(&mut self) -> HeaderState {
        // Arm the transient deadline, remembering what to put back. The
        // restore runs on every exit path below.
        let mut restore = None;
        if let Some(timeout) = self.read_header_timeout {
            match self.source.get_ref().read_timeout() {
                Ok(original) => restore = Some(original),
                Err(e) => return HeaderState::Failed(e.into()),
            }
            if let Err(e) = self.source.get_ref().set_read_timeout(Some(timeout)) {
                return HeaderState::Failed(e.into());
            }
        }

        let result = ProxyHeader::read(&mut self.source);

        if let Some(original) = restore {
            let _ = self.source.get_ref().set_read_timeout(original);
        }

        // A deadline expiry means the peer is silent, not malicious: treat
        // it as an absent header and let the policy decide.
        let result = match result {
            Err(e) if e.is_timeout() => Err(Error::NoProxyProtocol),
            other => other,
        };

        match result {
            Ok(header) => match self.policy {
                Policy::Reject => HeaderState::Failed(Error::SuperfluousProxyHeader),
                Policy::Ignore => {
                    trace!("discarding proxy protocol header per policy");
                    HeaderState::Bypass
                }
                Policy::Use | Policy::Require => {
                    if let Some(validate) = &self.validator {
                        if let Err(e) = validate(&header) {
                            return HeaderState::Failed(e);
                        }
                    }
                    trace!(transport = ?header.transport, "read proxy protocol header");
                    HeaderState::HeaderRead(header)
                }
                // attempt() resolves Skip before any header read happens.
                Policy::Skip => unreachable!("skip policy never reads a header"),
            },
            Err(Error::NoProxyProtocol) => {
                if self.policy == Policy::Require {
                    HeaderState::Failed(Error::NoProxyProtocol)
                } else {
                    debug!("no proxy protocol header, continuing as plain stream");
                    HeaderState::Bypass
                }
            }
            Err(e) => HeaderState::Failed(e),
        }
    }
}

impl<S: NetStream> Read for ProxyConn<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.attempt();
        if let HeaderState::Failed(e) = &self.state {
            return Err(e.clone().into());
        }
        self.source.read(buf)
    }
}

impl<S: NetStream> Write for ProxyConn<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.source.get_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.source.get_mut().flush()
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.source.get_mut().write_vectored(bufs)
    }
}

#[cfg(unix)]
impl<S: NetStream + AsRawFd> AsRawFd for ProxyConn<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.source.get_ref().as_raw_fd()
    }
}

#[cfg(unix)]
impl<S: NetStream + AsFd> AsFd for ProxyConn<S> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.source.get_ref().as_fd()
    }
}
