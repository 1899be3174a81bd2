//! Per-connection policy: whether an upstream may, must or must not send a
//! PROXY protocol header.

use std::time::Duration;

use crate::{Addr, Error, ProxyHeader};

/// Header-read timeout applied when a listener has not configured one.
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// What to do about a PROXY protocol header on an accepted connection.
///
/// | Policy    | Header present             | Header absent            |
/// |-----------|----------------------------|--------------------------|
/// | `Use`     | parse, expose addresses    | plain stream             |
/// | `Require` | parse, expose addresses    | fail `NoProxyProtocol`   |
/// | `Reject`  | fail `SuperfluousProxyHeader` | plain stream          |
/// | `Ignore`  | parse, discard             | plain stream             |
/// | `Skip`    | never read                 | never read               |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Use the header when the upstream sends one.
    Use,
    /// The upstream must send a header.
    Require,
    /// The upstream must not send a header.
    Reject,
    /// Consume a header if present but expose the socket addresses.
    Ignore,
    /// Do not even look for a header.
    Skip,
}

/// The endpoints of an accepted connection, as seen by the policy function.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    /// The peer of the accepted socket, i.e. the proxy (or the client, when
    /// no proxy is in the path).
    pub upstream: Addr,
    /// The local address the connection arrived on.
    pub downstream: Addr,
}

/// Decides the [`Policy`] for a connection from its endpoints.
///
/// Returning [`Error::InvalidUpstream`] tells the listener adapter to drop
/// the connection and keep accepting; any other error aborts the accept.
pub(crate) type PolicyFn = dyn Fn(&PolicyContext) -> Result<Policy, Error> + Send + Sync;

/// Inspects a freshly parsed header; an error poisons the connection.
pub(crate) type ValidatorFn = dyn Fn(&ProxyHeader) -> Result<(), Error> + Send + Sync;

/// Normalize a configured header-read timeout: zero means "use the default",
/// `None` disables the timeout altogether.
pub(crate) fn resolve_timeout(timeout: Option<Duration>) -> Option<Duration> {
    match timeout {
        Some(d) if d.is_zero() => Some(DEFAULT_READ_HEADER_TIMEOUT),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_means_default() {
        assert_eq!(
            resolve_timeout(Some(Duration::ZERO)),
            Some(DEFAULT_READ_HEADER_TIMEOUT)
        );
        assert_eq!(resolve_timeout(None), None);
        assert_eq!(
            resolve_timeout(Some(Duration::from_millis(250))),
            Some(Duration::from_millis(250))
        );
    }
}
