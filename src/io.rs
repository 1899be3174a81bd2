//! Async interception for tokio streams.
//!
//! [`ProxiedStream`] is the async counterpart of
//! [`ProxyConn`](crate::ProxyConn). The header read happens up front, in
//! [`ProxiedStream::read_from`] or [`Incoming::establish`], bounded by
//! `tokio::time::timeout`; a deadline expiry is treated as an absent header
//! and handed to the policy, and any bytes consumed before the deadline are
//! retained and replayed as payload.
//!
//! [`ProxiedListener`] keeps the accept loop free of peer-controlled I/O:
//! [`accept`](ProxiedListener::accept) only evaluates the policy and returns
//! an [`Incoming`]; the header read belongs in the per-connection task.
//!
//! ```no_run
//! use proxy_wire::io::ProxiedListener;
//! use proxy_wire::Policy;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = ProxiedListener::new(TcpListener::bind("[::]:9000").await?)
//!         .with_policy(|_ctx| Ok(Policy::Use));
//!
//!     loop {
//!         let incoming = listener.accept().await?;
//!         tokio::spawn(async move {
//!             let mut conn = match incoming.establish().await {
//!                 Ok(conn) => conn,
//!                 Err(_) => return,
//!             };
//!             if let Some(addr) = conn.peer_addr() {
//!                 println!("client: {addr}");
//!             }
//!             let mut buf = vec![0u8; 1024];
//!             while let Ok(n) = conn.read(&mut buf).await {
//!                 if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         });
//!     }
//! }
//! ```

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

#[cfg(unix)]
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use pin_project_lite::pin_project;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::addr::Addr;
#[cfg(unix)]
use crate::addr::UnixAddr;
use crate::policy::{resolve_timeout, Policy, PolicyContext, PolicyFn, ValidatorFn};
use crate::{v1, v2, Error, ProxyHeader, DEFAULT_READ_HEADER_TIMEOUT};

pin_project! {
    /// A stream whose PROXY protocol header has already been resolved.
    ///
    /// Reads drain any bytes buffered beyond the header, then go straight to
    /// the underlying stream; writes always pass through untouched.
    #[derive(Debug)]
    pub struct ProxiedStream<IO> {
        #[pin]
        io: IO,
        remaining: Vec<u8>,
        header: Option<ProxyHeader>,
        fallback: Option<(Addr, Addr)>,
    }
}

impl<IO> ProxiedStream<IO> {
    /// Wrap a stream that carries no header (or whose header should not be
    /// looked for).
    pub fn unproxied(io: IO) -> ProxiedStream<IO> {
        ProxiedStream {
            io,
            remaining: Vec::new(),
            header: None,
            fallback: None,
        }
    }

    /// Record the socket's own addresses, used whenever the header does not
    /// supply endpoints. [`Incoming::establish`] does this automatically.
    pub fn with_socket_addrs(mut self, local: Addr, peer: Addr) -> ProxiedStream<IO> {
        self.fallback = Some((local, peer));
        self
    }

    /// The header, when one was read and the policy kept it.
    pub fn proxy_header(&self) -> Option<&ProxyHeader> {
        self.header.as_ref()
    }

    /// The perceived local address: the header's destination for a PROXY
    /// command, the socket's own address otherwise (when known).
    pub fn local_addr(&self) -> Option<Addr> {
        match &self.header {
            Some(h) if !h.command.is_local() && h.destination.is_some() => h.destination.clone(),
            _ => self.fallback.as_ref().map(|(local, _)| local.clone()),
        }
    }

    /// The perceived peer address: the header's source for a PROXY command,
    /// the socket's peer otherwise (when known).
    pub fn peer_addr(&self) -> Option<Addr> {
        match &self.header {
            Some(h) if !h.command.is_local() && h.source.is_some() => h.source.clone(),
            _ => self.fallback.as_ref().map(|(_, peer)| peer.clone()),
        }
    }

    pub fn get_ref(&self) -> &IO {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    pub fn get_pin_mut(self: Pin<&mut Self>) -> Pin<&mut IO> {
        self.project().io
    }

    /// Discard the wrapper. Payload bytes buffered beyond the header are
    /// lost.
    pub fn into_inner(self) -> IO {
        self.io
    }
}

impl<IO: AsyncRead + Unpin> ProxiedStream<IO> {
    /// Read the header from the front of `io` under `policy`.
    ///
    /// The read is bounded by `timeout` (`None` disables the bound, zero
    /// selects [`DEFAULT_READ_HEADER_TIMEOUT`]); expiry counts as "no
    /// header" and the policy decides whether that is acceptable. On
    /// [`Policy::Skip`] the stream is returned untouched.
    pub async fn read_from(
        io: IO,
        policy: Policy,
        timeout: Option<Duration>,
    ) -> Result<ProxiedStream<IO>, Error> {
        ProxiedStream::establish(io, policy, None, resolve_timeout(timeout)).await
    }

    pub(crate) async fn establish(
        mut io: IO,
        policy: Policy,
        validator: Option<Arc<ValidatorFn>>,
        timeout: Option<Duration>,
    ) -> Result<ProxiedStream<IO>, Error> {
        if policy == Policy::Skip {
            return Ok(ProxiedStream::unproxied(io));
        }

        // The accumulation buffer lives outside the timed future so that
        // bytes consumed before an expiry survive as payload.
        let mut buf = Vec::with_capacity(256);
        let result = match timeout {
            Some(t) => match tokio::time::timeout(t, read_header(&mut io, &mut buf)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(Error::NoProxyProtocol),
            },
            None => read_header(&mut io, &mut buf).await,
        };

        let mut stream = ProxiedStream {
            io,
            remaining: buf,
            header: None,
            fallback: None,
        };

        match result {
            Ok((header, consumed)) => {
                stream.remaining.drain(..consumed);
                match policy {
                    Policy::Reject => Err(Error::SuperfluousProxyHeader),
                    Policy::Ignore | Policy::Skip => Ok(stream),
                    Policy::Use | Policy::Require => {
                        if let Some(validate) = &validator {
                            validate(&header)?;
                        }
                        stream.header = Some(header);
                        Ok(stream)
                    }
                }
            }
            Err(Error::NoProxyProtocol) if policy != Policy::Require => {
                debug!("no proxy protocol header, continuing as plain stream");
                Ok(stream)
            }
            Err(e) => Err(e),
        }
    }
}

async fn read_header<IO: AsyncRead + Unpin>(
    io: &mut IO,
    buf: &mut Vec<u8>,
) -> Result<(ProxyHeader, usize), Error> {
    loop {
        match ProxyHeader::parse(buf) {
            Ok(parsed) => return Ok(parsed),
            Err(Error::BufferTooShort) => {
                let n = io.read_buf(buf).await.map_err(Error::from)?;
                if n == 0 {
                    return Err(eof_error(buf));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// The stream ended inside a header; name the stage that was cut off.
fn eof_error(buf: &[u8]) -> Error {
    if buf.starts_with(v1::GREETING) {
        return Error::CantReadVersion1Header;
    }
    if buf.len() >= v2::SIGNATURE.len() && buf.starts_with(&v2::SIGNATURE) {
        return match buf.len() {
            12 => Error::CantReadProtocolVersionAndCommand,
            13 => Error::CantReadAddressFamilyAndProtocol,
            14 | 15 => Error::CantReadLength,
            _ => Error::InvalidLength,
        };
    }
    Error::NoProxyProtocol
}

impl<IO: AsyncRead> AsyncRead for ProxiedStream<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.project();

        if !me.remaining.is_empty() {
            let len = me.remaining.len().min(buf.remaining());
            buf.put_slice(&me.remaining[..len]);
            me.remaining.drain(..len);
            return Poll::Ready(Ok(()));
        }

        me.io.poll_read(cx, buf)
    }
}

impl<IO: AsyncBufRead> AsyncBufRead for ProxiedStream<IO> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let me = self.project();
        if !me.remaining.is_empty() {
            return Poll::Ready(Ok(&me.remaining[..]));
        }
        me.io.poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let me = self.project();
        if !me.remaining.is_empty() {
            let len = me.remaining.len().min(amt);
            me.remaining.drain(..len);
            return;
        }
        me.io.consume(amt);
    }
}

impl<IO: AsyncWrite> AsyncWrite for ProxiedStream<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().io.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().io.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

#[cfg(unix)]
impl<IO: AsRawFd> AsRawFd for ProxiedStream<IO> {
    fn as_raw_fd(&self) -> RawFd {
        self.io.as_raw_fd()
    }
}

#[cfg(unix)]
impl<IO: AsFd> AsFd for ProxiedStream<IO> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.io.as_fd()
    }
}

/// A listening endpoint that yields async streams and their peer address.
pub trait AsyncAccept {
    type Stream: AsyncRead + AsyncWrite + Unpin;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Stream, Addr)>>;
    fn local_addr(&self) -> io::Result<Addr>;
}

impl AsyncAccept for TcpListener {
    type Stream = TcpStream;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, Addr)>> {
        TcpListener::poll_accept(self, cx).map_ok(|(stream, peer)| (stream, Addr::Inet(peer)))
    }

    fn local_addr(&self) -> io::Result<Addr> {
        TcpListener::local_addr(self).map(Addr::Inet)
    }
}

#[cfg(unix)]
fn tokio_unix_addr(addr: tokio::net::unix::SocketAddr) -> Addr {
    match addr.as_pathname() {
        Some(path) => Addr::Unix(path.into()),
        None => Addr::Unix(UnixAddr::default()),
    }
}

#[cfg(unix)]
impl AsyncAccept for UnixListener {
    type Stream = UnixStream;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(UnixStream, Addr)>> {
        UnixListener::poll_accept(self, cx).map_ok(|(stream, peer)| (stream, tokio_unix_addr(peer)))
    }

    fn local_addr(&self) -> io::Result<Addr> {
        UnixListener::local_addr(self).map(tokio_unix_addr)
    }
}

/// An accepted connection whose header has not been read yet.
///
/// Produced by [`ProxiedListener::accept`]; call
/// [`establish`](Incoming::establish) from the per-connection task to
/// perform the bounded header read.
pub struct Incoming<IO> {
    stream: IO,
    policy: Policy,
    validator: Option<Arc<ValidatorFn>>,
    timeout: Option<Duration>,
    local: Addr,
    peer: Addr,
}

impl<IO> Incoming<IO> {
    /// The policy the listener resolved for this connection.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// The socket's peer address (the proxy, not the client).
    pub fn peer_addr(&self) -> &Addr {
        &self.peer
    }

    pub fn local_addr(&self) -> &Addr {
        &self.local
    }
}

impl<IO: AsyncRead + Unpin> Incoming<IO> {
    /// Perform the one-shot header read and wrap the stream.
    pub async fn establish(self) -> Result<ProxiedStream<IO>, Error> {
        let Incoming {
            stream,
            policy,
            validator,
            timeout,
            local,
            peer,
        } = self;
        let stream = ProxiedStream::establish(stream, policy, validator, timeout).await?;
        Ok(stream.with_socket_addrs(local, peer))
    }
}

/// The async accept adapter.
///
/// Applies the policy function on accept and hands the (possibly slow)
/// header read to the caller as an [`Incoming`]. Connections the policy
/// rejects with [`Error::InvalidUpstream`] are closed and skipped.
pub struct ProxiedListener<L: AsyncAccept> {
    inner: L,
    policy: Option<Arc<PolicyFn>>,
    validator: Option<Arc<ValidatorFn>>,
    read_header_timeout: Option<Duration>,
    optimizer: Option<Box<dyn Fn(&L::Stream) + Send + Sync>>,
}

impl<L: AsyncAccept> ProxiedListener<L> {
    pub fn new(inner: L) -> ProxiedListener<L> {
        ProxiedListener {
            inner,
            policy: None,
            validator: None,
            read_header_timeout: Some(DEFAULT_READ_HEADER_TIMEOUT),
            optimizer: None,
        }
    }

    /// Run a socket-tuning hook on every accepted stream, before the policy
    /// is consulted.
    pub fn with_optimizer(
        mut self,
        optimize: impl Fn(&L::Stream) + Send + Sync + 'static,
    ) -> ProxiedListener<L> {
        self.optimizer = Some(Box::new(optimize));
        self
    }

    /// See [`ProxyListener::with_policy`](crate::ProxyListener::with_policy).
    pub fn with_policy(
        mut self,
        policy: impl Fn(&PolicyContext) -> Result<Policy, Error> + Send + Sync + 'static,
    ) -> ProxiedListener<L> {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn with_validator(
        mut self,
        validate: impl Fn(&ProxyHeader) -> Result<(), Error> + Send + Sync + 'static,
    ) -> ProxiedListener<L> {
        self.validator = Some(Arc::new(validate));
        self
    }

    /// `None` disables the header-read bound, zero re-selects the default.
    pub fn with_read_header_timeout(mut self, timeout: Option<Duration>) -> ProxiedListener<L> {
        self.read_header_timeout = resolve_timeout(timeout);
        self
    }

    /// Accept the next permitted connection.
    pub async fn accept(&self) -> Result<Incoming<L::Stream>, Error> {
        loop {
            let (stream, peer) = poll_fn(|cx| self.inner.poll_accept(cx))
                .await
                .map_err(Error::from)?;
            if let Some(optimize) = &self.optimizer {
                optimize(&stream);
            }
            let local = self.inner.local_addr().map_err(Error::from)?;

            let policy = match &self.policy {
                None => Policy::Use,
                Some(decide) => {
                    let ctx = PolicyContext {
                        upstream: peer.clone(),
                        downstream: local.clone(),
                    };
                    match decide(&ctx) {
                        Ok(policy) => policy,
                        Err(Error::InvalidUpstream) => {
                            debug!(upstream = %peer, "dropping connection from untrusted upstream");
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            return Ok(Incoming {
                stream,
                policy,
                validator: self.validator.clone(),
                timeout: self.read_header_timeout,
                local,
                peer,
            });
        }
    }

    pub fn local_addr(&self) -> io::Result<Addr> {
        self.inner.local_addr()
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}
