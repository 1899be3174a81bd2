//! The accept adapter: policy evaluation in front of [`ProxyConn`].

use std::io;
use std::net::{TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::addr::Addr;
#[cfg(unix)]
use crate::addr::UnixAddr;
use crate::conn::{NetStream, ProxyConn};
use crate::policy::{resolve_timeout, Policy, PolicyContext, PolicyFn, ValidatorFn};
use crate::{Error, DEFAULT_READ_HEADER_TIMEOUT};

/// A listening endpoint that yields [`NetStream`] connections.
pub trait Listen {
    type Stream: NetStream;

    fn accept(&self) -> io::Result<Self::Stream>;
    fn local_addr(&self) -> io::Result<Addr>;
}

impl Listen for TcpListener {
    type Stream = TcpStream;

    fn accept(&self) -> io::Result<TcpStream> {
        TcpListener::accept(self).map(|(stream, _)| stream)
    }

    fn local_addr(&self) -> io::Result<Addr> {
        TcpListener::local_addr(self).map(Addr::Inet)
    }
}

#[cfg(unix)]
impl Listen for UnixListener {
    type Stream = UnixStream;

    fn accept(&self) -> io::Result<UnixStream> {
        UnixListener::accept(self).map(|(stream, _)| stream)
    }

    fn local_addr(&self) -> io::Result<Addr> {
        UnixListener::local_addr(self).map(|addr| match addr.as_pathname() {
            Some(path) => Addr::Unix(path.into()),
            None => Addr::Unix(UnixAddr::default()),
        })
    }
}

/// Wraps a listener so that accepted connections may carry a PROXY protocol
/// header.
///
/// On each accept the configured policy function decides, from the peer and
/// local addresses alone, how the new connection's header should be treated.
/// Without a policy function every connection gets [`Policy::Use`]. The
/// header-read timeout defaults to
/// [`DEFAULT_READ_HEADER_TIMEOUT`]; a zero duration re-selects the default
/// and `None` disables the bound.
pub struct ProxyListener<L: Listen> {
    inner: L,
    policy: Option<Arc<PolicyFn>>,
    validator: Option<Arc<ValidatorFn>>,
    read_header_timeout: Option<Duration>,
    optimizer: Option<Box<dyn Fn(&L::Stream) + Send + Sync>>,
}

impl<L: Listen> ProxyListener<L> {
    pub fn new(inner: L) -> ProxyListener<L> {
        ProxyListener {
            inner,
            policy: None,
            validator: None,
            read_header_timeout: Some(DEFAULT_READ_HEADER_TIMEOUT),
            optimizer: None,
        }
    }

    /// Decide a per-connection [`Policy`] from the connection endpoints.
    ///
    /// Returning [`Error::InvalidUpstream`] drops the connection and keeps
    /// accepting; any other error closes the connection and surfaces from
    /// [`accept`](ProxyListener::accept).
    pub fn with_policy(
        mut self,
        policy: impl Fn(&PolicyContext) -> Result<Policy, Error> + Send + Sync + 'static,
    ) -> ProxyListener<L> {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Validate every successfully parsed header before it is accepted.
    pub fn with_validator(
        mut self,
        validate: impl Fn(&crate::ProxyHeader) -> Result<(), Error> + Send + Sync + 'static,
    ) -> ProxyListener<L> {
        self.validator = Some(Arc::new(validate));
        self
    }

    /// Bound the header read on accepted connections. `None` disables the
    /// bound, zero re-selects [`DEFAULT_READ_HEADER_TIMEOUT`].
    pub fn with_read_header_timeout(mut self, timeout: Option<Duration>) -> ProxyListener<L> {
        self.read_header_timeout = resolve_timeout(timeout);
        self
    }

    /// Run a socket-tuning hook on every accepted stream, before the policy
    /// is consulted.
    pub fn with_optimizer(
        mut self,
        optimize: impl Fn(&L::Stream) + Send + Sync + 'static,
    ) -> ProxyListener<L> {
        self.optimizer = Some(Box::new(optimize));
        self
    }

    /// Accept the next permitted connection.
    ///
    /// Connections whose policy function returns
    /// [`Error::InvalidUpstream`] are closed and skipped. The returned
    /// wrapper has not performed any I/O yet; the header is read on first
    /// use. Under [`Policy::Skip`] the wrapper never looks for a header and
    /// behaves exactly like the raw stream.
    pub fn accept(&self) -> Result<ProxyConn<L::Stream>, Error> {
        loop {
            let stream = self.inner.accept().map_err(Error::from)?;
            if let Some(optimize) = &self.optimizer {
                optimize(&stream);
            }

            let policy = match &self.policy {
                None => Policy::Use,
                Some(decide) => {
                    let ctx = PolicyContext {
                        upstream: stream.peer_addr().map_err(Error::from)?,
                        downstream: stream.local_addr().map_err(Error::from)?,
                    };
                    match decide(&ctx) {
                        Ok(policy) => policy,
                        Err(Error::InvalidUpstream) => {
                            debug!(upstream = %ctx.upstream, "dropping connection from untrusted upstream");
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            let mut conn = ProxyConn::new(stream, policy)
                .with_read_header_timeout(self.read_header_timeout);
            if let Some(validate) = &self.validator {
                conn = conn.with_shared_validator(validate.clone());
            }
            return Ok(conn);
        }
    }

    /// The wrapped listener's own address.
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const V1_HEADER: &[u8] = b"PROXY TCP4 10.1.1.1 20.2.2.2 1000 2000\r\n";

    fn bound_listener() -> (ProxyListener<TcpListener>, SocketAddr) {
        let inner = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = inner.local_addr().unwrap();
        (ProxyListener::new(inner), addr)
    }

    #[test]
    fn accept_applies_policy_context() {
        let (listener, addr) = bound_listener();
        let listener = listener.with_policy(move |ctx| {
            assert_eq!(ctx.downstream, Addr::Inet(addr));
            assert!(ctx.upstream.inet().is_some());
            Ok(Policy::Use)
        });

        let handle = thread::spawn(move || {
            let mut client = TcpStream::connect(addr).unwrap();
            client.write_all(V1_HEADER).unwrap();
            client.write_all(b"HELO").unwrap();
            client
        });

        let mut conn = listener.accept().unwrap();
        assert_eq!(
            conn.remote_addr().unwrap(),
            Addr::Inet("10.1.1.1:1000".parse().unwrap())
        );
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"HELO");
        handle.join().unwrap();
    }

    #[test]
    fn invalid_upstream_is_dropped_and_accept_continues() {
        let (listener, addr) = bound_listener();
        let seen = AtomicUsize::new(0);
        let listener = listener.with_policy(move |_ctx| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::InvalidUpstream)
            } else {
                Ok(Policy::Use)
            }
        });

        let handle = thread::spawn(move || {
            // First connection gets dropped by policy; the second one is
            // served.
            let first = TcpStream::connect(addr).unwrap();
            let mut second = TcpStream::connect(addr).unwrap();
            second.write_all(V1_HEADER).unwrap();
            drop(first);
            second
        });

        let mut conn = listener.accept().unwrap();
        assert_eq!(
            conn.remote_addr().unwrap(),
            Addr::Inet("10.1.1.1:1000".parse().unwrap())
        );
        handle.join().unwrap();
    }

    #[test]
    fn policy_error_surfaces_from_accept() {
        let (listener, addr) = bound_listener();
        let listener = listener.with_policy(|_ctx| Err(Error::InvalidAddress));

        let handle = thread::spawn(move || TcpStream::connect(addr).unwrap());
        assert!(matches!(listener.accept(), Err(Error::InvalidAddress)));
        handle.join().unwrap();
    }

    #[test]
    fn skip_policy_returns_untouched_stream() {
        let (listener, addr) = bound_listener();
        let listener = listener.with_policy(|_ctx| Ok(Policy::Skip));

        let handle = thread::spawn(move || {
            let mut client = TcpStream::connect(addr).unwrap();
            client.write_all(V1_HEADER).unwrap();
            client
        });

        let mut conn = listener.accept().unwrap();
        let mut buf = vec![0u8; V1_HEADER.len()];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(buf, V1_HEADER);
        handle.join().unwrap();
    }

    #[test]
    fn optimizer_hook_runs_before_policy() {
        let (listener, addr) = bound_listener();
        let listener = listener
            .with_optimizer(|stream| {
                stream.set_nodelay(true).unwrap();
            })
            .with_policy(|_ctx| Ok(Policy::Use));

        let handle = thread::spawn(move || {
            let mut client = TcpStream::connect(addr).unwrap();
            client.write_all(V1_HEADER).unwrap();
            client
        });

        let conn = listener.accept().unwrap();
        assert!(conn.get_ref().nodelay().unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn listener_validator_reaches_connections() {
        let (listener, addr) = bound_listener();
        let listener = listener.with_validator(|header| {
            if header.transport == crate::Transport::Tcp4 {
                Err(Error::InvalidAddress)
            } else {
                Ok(())
            }
        });

        let handle = thread::spawn(move || {
            let mut client = TcpStream::connect(addr).unwrap();
            client.write_all(V1_HEADER).unwrap();
            client
        });

        let mut conn = listener.accept().unwrap();
        assert!(matches!(conn.proxy_header(), Err(Error::InvalidAddress)));
        handle.join().unwrap();
    }
}
