use crate::dns::ResolveError;
use crate::establish::socks5::ReplyCode;
use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Every way a routing decision or a connection attempt can fail.
///
/// None of these reach the intercepted caller verbatim: the C boundary reports
/// all of them as a timed-out connect. The detail only feeds the log.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("unsupported address family {family}")]
    InvalidEndpoint { family: i32 },
    #[error("policy engine unavailable: {0}")]
    PolicyUnavailable(String),
    #[error("timed out")]
    DialTimeout,
    #[error("connection refused ({0})")]
    DialRefused(String),
    #[error("unreachable ({0})")]
    DialUnreachable(String),
    #[error("proxy rejected request: {0}")]
    ProxyRejected(ReplyCode),
    #[error("proxy protocol error: {0}")]
    ProxyProtocol(String),
    #[error("closed by peer")]
    PeerClosed,
    #[error("synthetic address {0} has no live binding")]
    StaleSyntheticAddress(Ipv4Addr),
    #[error("resolve failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Io(io::Error),
}

impl RouteError {
    /// Classifies an OS-level socket error into the dial taxonomy.
    pub fn from_os(error: io::Error) -> Self {
        match error.raw_os_error() {
            Some(libc::ECONNREFUSED) => RouteError::DialRefused(error.to_string()),
            Some(libc::ENETUNREACH) | Some(libc::EHOSTUNREACH) => {
                RouteError::DialUnreachable(error.to_string())
            }
            Some(libc::ETIMEDOUT) => RouteError::DialTimeout,
            _ => match error.kind() {
                io::ErrorKind::TimedOut => RouteError::DialTimeout,
                io::ErrorKind::ConnectionRefused => RouteError::DialRefused(error.to_string()),
                _ => RouteError::Io(error),
            },
        }
    }

    /// Maps a non-success SOCKS5 reply code onto the taxonomy.
    pub fn from_reply(code: ReplyCode) -> Self {
        match code {
            ReplyCode::ConnectionRefused => RouteError::DialRefused(code.to_string()),
            ReplyCode::NetworkUnreachable | ReplyCode::HostUnreachable => {
                RouteError::DialUnreachable(code.to_string())
            }
            other => RouteError::ProxyRejected(other),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RouteError::DialTimeout)
    }
}

impl From<io::Error> for RouteError {
    fn from(error: io::Error) -> Self {
        RouteError::from_os(error)
    }
}
