//! Proxy decisions: the bridge to the external policy engine and the
//! per-destination cache in front of it.

pub mod rules;

use crate::endpoint::Endpoint;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::resolve_table::ResolveTable;
use crate::stats::{RouteEvent, RouteStats};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy function missing")]
    Missing,
    #[error("policy evaluation failed: {0}")]
    Failed(String),
}

/// Raw answer of a policy evaluation. `host == None` asks for a direct
/// connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyAnswer {
    pub host: Option<String>,
    pub port: u16,
    pub no_cache: bool,
}

impl PolicyAnswer {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn proxy(proxy: SocketAddrV4) -> Self {
        Self {
            host: Some(proxy.ip().to_string()),
            port: proxy.port(),
            no_cache: false,
        }
    }

    pub fn uncached(mut self) -> Self {
        self.no_cache = true;
        self
    }
}

/// The external, scriptable decision maker. Implementations must be callable
/// from any thread.
pub trait PolicyEngine: Send + Sync {
    fn evaluate(&self, application: &str, name: &str, port: u16)
        -> Result<PolicyAnswer, PolicyError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyDecision {
    Direct,
    Socks5(SocketAddrV4),
}

impl ProxyDecision {
    pub fn proxy(&self) -> Option<SocketAddrV4> {
        match self {
            ProxyDecision::Direct => None,
            ProxyDecision::Socks5(proxy) => Some(*proxy),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, ProxyDecision::Direct)
    }
}

/// Memoizes policy answers per `name:port`.
///
/// Entries live as long as the cache; cardinality is bounded by the distinct
/// destinations a process contacts. The lock is never held across the policy
/// call.
pub struct ProxyCache {
    entries: RwLock<FxHashMap<String, ProxyDecision>>,
    policy: Arc<dyn PolicyEngine>,
    application: String,
    stats: Arc<RouteStats>,
}

impl ProxyCache {
    pub fn new(
        policy: Arc<dyn PolicyEngine>,
        application: impl Into<String>,
        stats: Arc<RouteStats>,
    ) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            policy,
            application: application.into(),
            stats,
        }
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn query_proxy(&self, name: &str, port: u16) -> ProxyDecision {
        if name.is_empty() || port == 0 {
            return ProxyDecision::Direct;
        }
        let key = format!("{name}:{port}");
        if let Some(decision) = self.entries.read().get(&key).copied() {
            self.stats.record(RouteEvent::CacheHit);
            return decision;
        }
        self.stats.record(RouteEvent::CacheMiss);

        let (decision, cacheable) = self.evaluate(name, port);
        if cacheable {
            self.entries.write().insert(key, decision);
        }
        decision
    }

    /// Queries by endpoint; synthetic addresses are reversed to their name
    /// first, everything else is queried by its numeric text.
    pub fn query_endpoint(&self, endpoint: &Endpoint, table: &ResolveTable) -> ProxyDecision {
        let name = match endpoint.ip() {
            IpAddr::V4(v4) if table.is_synthetic_address(v4) => {
                table.address_to_name(v4).unwrap_or_default()
            }
            ip => ip.to_string(),
        };
        self.query_proxy(&name, endpoint.port())
    }

    fn evaluate(&self, name: &str, port: u16) -> (ProxyDecision, bool) {
        let answer = match self.policy.evaluate(&self.application, name, port) {
            Ok(answer) => answer,
            Err(error) => {
                self.stats.record(RouteEvent::PolicyFailure);
                logger::rate_limited_error(
                    ErrorCategory::Policy,
                    format!("policy query for {name}:{port} failed: {error}"),
                );
                return (ProxyDecision::Direct, false);
            }
        };
        let Some(host) = answer.host.as_deref() else {
            return (ProxyDecision::Direct, !answer.no_cache);
        };
        match host.trim().parse::<Ipv4Addr>() {
            Ok(ip) if answer.port != 0 => {
                logger::breadcrumb(
                    BreadcrumbFlags::POLICY,
                    format!("{name}:{port} -> socks5 {ip}:{}", answer.port),
                );
                (
                    ProxyDecision::Socks5(SocketAddrV4::new(ip, answer.port)),
                    !answer.no_cache,
                )
            }
            _ => {
                self.stats.record(RouteEvent::PolicyFailure);
                logger::rate_limited_error(
                    ErrorCategory::Policy,
                    format!(
                        "policy answered unusable proxy {host}:{} for {name}:{port}",
                        answer.port
                    ),
                );
                (ProxyDecision::Direct, false)
            }
        }
    }
}
