//! Composition root: one `Router` owns the resolve table, the bypass rules,
//! the proxy cache and the establisher, and answers the questions the
//! interception layer asks on behalf of a hooked call.

use crate::bypass::{self, BypassRules};
use crate::dns::{Resolver, SystemResolver};
use crate::endpoint::Endpoint;
use crate::error::RouteError;
use crate::establish::{socket, Establisher, DEFAULT_DIAL_TIMEOUT};
use crate::ffi::RouteCounters;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::policy::{PolicyEngine, ProxyCache, ProxyDecision};
use crate::resolve_table::{ResolveTable, DEFAULT_PREFIX, MAX_CAPACITY};
use crate::stats::{RouteEvent, RouteStats};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Ceiling for every readiness wait of a dial.
    pub dial_timeout: Duration,
    pub synthetic_prefix: u8,
    pub table_capacity: usize,
    pub bypass: BypassRules,
    /// Identity handed to the policy engine with every query.
    pub application: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            synthetic_prefix: DEFAULT_PREFIX,
            table_capacity: MAX_CAPACITY,
            bypass: BypassRules::default(),
            application: process_name(),
        }
    }
}

/// Where a destination goes, before anything is dialed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Bypass,
    Direct(Endpoint),
    Proxied {
        endpoint: Endpoint,
        proxy: SocketAddrV4,
    },
}

#[derive(Debug)]
pub enum ConnectVerdict {
    /// Not ours; the caller runs the original primitive.
    Passthrough,
    Connected,
    /// The caller's descriptor is non-blocking and now holds an established
    /// connection; report "in progress" the way a non-blocking connect would.
    InProgress,
    Failed(RouteError),
}

/// Who is asking for a forward lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveIntent {
    Application,
    /// The caller asked for numeric hosts only.
    NumericHost,
    /// The policy engine resolving names for its own decisions.
    Policy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameResolution {
    Passthrough,
    Synthetic(SocketAddrV4),
}

pub struct Router {
    table: Arc<ResolveTable>,
    bypass: BypassRules,
    cache: ProxyCache,
    establisher: Establisher,
    stats: Arc<RouteStats>,
}

impl Router {
    pub fn new(config: RouterConfig, policy: Arc<dyn PolicyEngine>) -> Self {
        Self::with_resolver(config, policy, Arc::new(SystemResolver::default()))
    }

    pub fn with_resolver(
        config: RouterConfig,
        policy: Arc<dyn PolicyEngine>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        let table = Arc::new(ResolveTable::new(
            config.synthetic_prefix,
            config.table_capacity,
        ));
        let stats = Arc::new(RouteStats::default());
        let cache = ProxyCache::new(policy, config.application, Arc::clone(&stats));
        let establisher = Establisher::new(Arc::clone(&table), resolver, config.dial_timeout);
        logger::breadcrumb(
            BreadcrumbFlags::ROUTE,
            format!(
                "router ready (app={}, prefix={}, capacity={}, timeout={:?})",
                cache.application(),
                table.prefix(),
                table.capacity(),
                establisher.timeout()
            ),
        );
        Self {
            table,
            bypass: config.bypass,
            cache,
            establisher,
            stats,
        }
    }

    pub fn application(&self) -> &str {
        self.cache.application()
    }

    pub fn resolve_table(&self) -> &ResolveTable {
        &self.table
    }

    /// Decides the route for `target` without dialing.
    pub fn route(&self, target: &SocketAddr) -> Route {
        let endpoint = Endpoint::normalize(target);
        if self.bypass.should_bypass_endpoint(&endpoint) {
            self.stats.record(RouteEvent::Bypassed);
            return Route::Bypass;
        }
        match self.cache.query_endpoint(&endpoint, &self.table) {
            ProxyDecision::Direct => Route::Direct(endpoint),
            ProxyDecision::Socks5(proxy) => Route::Proxied { endpoint, proxy },
        }
    }

    /// Decides the route for a hostname endpoint. Numeric names go through
    /// the address rules; other names are checked against the name
    /// exemptions before the policy is asked about `name:port`. The returned
    /// endpoint carries the name's synthetic address so a later dial can
    /// still reach the proxy by name.
    pub fn route_name(&self, name: &str, port: u16) -> Route {
        if let Some(ip) = bypass::parse_numeric_host(name) {
            return self.route(&SocketAddr::new(ip, port));
        }
        if self.bypass.should_bypass_name(name, None) {
            self.stats.record(RouteEvent::Bypassed);
            return Route::Bypass;
        }
        let decision = self.cache.query_proxy(name, port);
        let endpoint = Endpoint::new(IpAddr::V4(self.table.name_to_address(name)), port);
        logger::breadcrumb(
            BreadcrumbFlags::ROUTE,
            format!("route {name}:{port} -> {decision:?}"),
        );
        match decision {
            ProxyDecision::Direct => Route::Direct(endpoint),
            ProxyDecision::Socks5(proxy) => Route::Proxied { endpoint, proxy },
        }
    }

    /// Routes and establishes a connection to `target`. `Ok(None)` means the
    /// destination bypasses routing and nothing was dialed.
    pub fn dial(&self, target: &SocketAddr) -> Result<Option<OwnedFd>, RouteError> {
        let (endpoint, decision, event) = match self.route(target) {
            Route::Bypass => return Ok(None),
            Route::Direct(endpoint) => (endpoint, ProxyDecision::Direct, RouteEvent::Direct),
            Route::Proxied { endpoint, proxy } => {
                (endpoint, ProxyDecision::Socks5(proxy), RouteEvent::Proxied)
            }
        };
        match self.establisher.establish(endpoint, decision) {
            Ok(fd) => {
                self.stats.record(event);
                Ok(Some(fd))
            }
            Err(error) => {
                self.stats.record(RouteEvent::Failed);
                Err(error)
            }
        }
    }

    /// Stands in for `connect(fd, target)`. On success `fd` refers to the
    /// routed connection; on failure it is left untouched.
    pub fn connect(&self, fd: RawFd, target: &SocketAddr) -> ConnectVerdict {
        if !socket::is_stream_socket(fd) {
            return ConnectVerdict::Passthrough;
        }
        let replacement = match self.dial(target) {
            Ok(Some(replacement)) => replacement,
            Ok(None) => return ConnectVerdict::Passthrough,
            Err(error) => return ConnectVerdict::Failed(error),
        };
        match socket::replace_descriptor(fd, replacement) {
            Ok(true) => ConnectVerdict::InProgress,
            Ok(false) => ConnectVerdict::Connected,
            Err(error) => {
                logger::rate_limited_error(
                    ErrorCategory::Descriptor,
                    format!("descriptor swap for fd {fd} failed: {error}"),
                );
                ConnectVerdict::Failed(RouteError::from_os(error))
            }
        }
    }

    /// Stands in for forward name resolution: names that do not bypass get a
    /// synthetic address so the later connect can be routed by name.
    pub fn resolve_name(
        &self,
        name: &str,
        service: Option<&str>,
        intent: ResolveIntent,
    ) -> NameResolution {
        if intent != ResolveIntent::Application || self.bypass.should_bypass_name(name, service) {
            return NameResolution::Passthrough;
        }
        let address = self.table.name_to_address(name);
        let port = service
            .and_then(|service| service.trim().parse::<u16>().ok())
            .unwrap_or(0);
        logger::breadcrumb(
            BreadcrumbFlags::DNS,
            format!("resolve {name}:{} -> {address}", service.unwrap_or("")),
        );
        NameResolution::Synthetic(SocketAddrV4::new(address, port))
    }

    /// Stands in for reverse resolution of synthetic addresses.
    pub fn reverse_name(&self, address: Ipv4Addr) -> Option<String> {
        if !self.table.is_synthetic_address(address) {
            return None;
        }
        self.table.address_to_name(address)
    }

    pub fn is_synthetic(&self, address: Ipv4Addr) -> bool {
        self.table.is_synthetic_address(address)
    }

    pub fn counters(&self) -> RouteCounters {
        self.stats.snapshot()
    }
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "unknown".to_string())
}
