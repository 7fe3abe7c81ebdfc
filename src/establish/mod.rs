//! Connection establishment: direct dials and SOCKS5 tunnels.
//!
//! Each attempt runs synchronously on the calling thread and ends either with
//! a connected descriptor or an error; nothing is retried beyond walking the
//! resolved candidates of a direct dial.

pub mod socket;
pub mod socks5;

use crate::dns::{Candidates, ResolveError, Resolver};
use crate::endpoint::Endpoint;
use crate::error::RouteError;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::policy::ProxyDecision;
use crate::resolve_table::ResolveTable;
use socket::StreamSocket;
use socks5::{BoundAddress, TargetAddr};
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-attempt context threaded through the dial instead of ambient state.
#[derive(Clone, Debug)]
pub struct DialContext {
    pub endpoint: Endpoint,
    pub decision: ProxyDecision,
    /// Name recovered from a synthetic address, if the target was one.
    pub target_name: Option<String>,
}

impl DialContext {
    fn describe_target(&self) -> String {
        match &self.target_name {
            Some(name) => format!("{name}:{}", self.endpoint.port()),
            None => self.endpoint.to_string(),
        }
    }
}

pub struct Establisher {
    table: Arc<ResolveTable>,
    resolver: Arc<dyn Resolver>,
    timeout: Duration,
}

impl Establisher {
    pub fn new(table: Arc<ResolveTable>, resolver: Arc<dyn Resolver>, timeout: Duration) -> Self {
        Self {
            table,
            resolver,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Builds the context for `endpoint`, recovering the bound name of a
    /// synthetic target. A synthetic target without a live binding is stale.
    pub fn context(
        &self,
        endpoint: Endpoint,
        decision: ProxyDecision,
    ) -> Result<DialContext, RouteError> {
        let target_name = match endpoint.ip() {
            IpAddr::V4(v4) if self.table.is_synthetic_address(v4) => Some(
                self.table
                    .address_to_name(v4)
                    .ok_or(RouteError::StaleSyntheticAddress(v4))?,
            ),
            _ => None,
        };
        Ok(DialContext {
            endpoint,
            decision,
            target_name,
        })
    }

    pub fn establish(
        &self,
        endpoint: Endpoint,
        decision: ProxyDecision,
    ) -> Result<OwnedFd, RouteError> {
        let context = self.context(endpoint, decision)?;
        match decision {
            ProxyDecision::Direct => self.direct_dial(&context),
            ProxyDecision::Socks5(proxy) => self.proxied_dial(&context, proxy),
        }
    }

    pub fn direct_dial(&self, context: &DialContext) -> Result<OwnedFd, RouteError> {
        let target = context.describe_target();
        let candidates = match &context.target_name {
            Some(name) => self
                .resolver
                .resolve(name, context.endpoint.port())
                .map_err(|error| {
                    logger::rate_limited_error(
                        ErrorCategory::DirectDial,
                        format!("direct connect failed: {target}...{error}"),
                    );
                    RouteError::from(error)
                })?,
            None => Candidates::from_elem(context.endpoint.socket_addr(), 1),
        };
        let candidates = self.real_candidates(context, candidates)?;

        let mut last_error = None;
        for candidate in candidates {
            match self.dial(&candidate) {
                Ok(socket) => {
                    logger::info(format!("direct connect: {target}...ok"));
                    return Ok(socket.into_fd()?);
                }
                Err(error) => {
                    logger::breadcrumb(
                        BreadcrumbFlags::DIAL,
                        format!("direct candidate {candidate} for {target} failed: {error}"),
                    );
                    last_error = Some(error);
                }
            }
        }
        let error = last_error.unwrap_or_else(|| {
            RouteError::Resolve(ResolveError::LookupFailed("no candidate addresses".into()))
        });
        logger::rate_limited_error(
            ErrorCategory::DirectDial,
            format!("direct connect failed: {target}...{error}"),
        );
        Err(error)
    }

    pub fn proxied_dial(
        &self,
        context: &DialContext,
        proxy: SocketAddrV4,
    ) -> Result<OwnedFd, RouteError> {
        let summary = format!("{proxy}...{}", context.describe_target());
        match self.negotiate(context, proxy) {
            Ok(socket) => {
                logger::info(format!("proxied connect: {summary}...ok"));
                Ok(socket.into_fd()?)
            }
            Err(error) => {
                logger::rate_limited_error(
                    ErrorCategory::ProxiedDial,
                    format!("proxied connect failed: {summary}...{error}"),
                );
                Err(error)
            }
        }
    }

    /// Drops placeholders handed back by a lookup that was itself routed
    /// through the synthetic table.
    fn real_candidates(
        &self,
        context: &DialContext,
        mut candidates: Candidates,
    ) -> Result<Candidates, RouteError> {
        if context.target_name.is_none() {
            return Ok(candidates);
        }
        let resolved = candidates.len();
        candidates.retain(|candidate| match candidate.ip() {
            IpAddr::V4(v4) => !self.table.is_synthetic_address(v4),
            IpAddr::V6(_) => true,
        });
        if candidates.is_empty() && resolved > 0 {
            let target = context.describe_target();
            logger::rate_limited_error(
                ErrorCategory::DirectDial,
                format!("direct connect failed: {target}...only synthetic candidates"),
            );
            return Err(match context.endpoint.ip() {
                IpAddr::V4(v4) => RouteError::StaleSyntheticAddress(v4),
                IpAddr::V6(_) => RouteError::Resolve(ResolveError::LookupFailed(
                    "only synthetic candidates".into(),
                )),
            });
        }
        Ok(candidates)
    }

    fn dial(&self, target: &SocketAddr) -> Result<StreamSocket, RouteError> {
        let socket = StreamSocket::open(target, self.timeout)?;
        socket.connect(target)?;
        Ok(socket)
    }

    fn negotiate(
        &self,
        context: &DialContext,
        proxy: SocketAddrV4,
    ) -> Result<StreamSocket, RouteError> {
        let target = match (&context.target_name, context.endpoint.ip()) {
            (Some(name), _) => TargetAddr::Domain(name),
            (None, IpAddr::V4(v4)) => TargetAddr::Ipv4(v4),
            (None, IpAddr::V6(v6)) => TargetAddr::Ipv6(v6),
        };
        // Validate before touching the network.
        let request = socks5::connect_request(&target, context.endpoint.port())?;

        let socket = self.dial(&SocketAddr::V4(proxy))?;
        logger::breadcrumb(
            BreadcrumbFlags::SOCKS,
            format!("connected to proxy {proxy}, negotiating for {target}"),
        );

        socket.send_all(&socks5::greeting())?;
        let mut method = [0u8; 2];
        socket.recv_exact(&mut method)?;
        socks5::check_method_reply(method)?;

        socket.send_all(&request)?;
        let mut header = [0u8; 4];
        socket.recv_exact(&mut header)?;
        let bound = socks5::parse_reply_header(header)?;
        let domain_len = if bound == BoundAddress::Domain {
            let mut len = [0u8; 1];
            socket.recv_exact(&mut len)?;
            len[0]
        } else {
            0
        };
        let mut trailer = [0u8; 257];
        socket.recv_exact(&mut trailer[..bound.remaining(domain_len)])?;
        Ok(socket)
    }
}

#[cfg(test)]
mod tests;
