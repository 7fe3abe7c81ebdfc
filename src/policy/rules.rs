//! In-process policy engine built from ordered host/application rules.

use super::{PolicyAnswer, PolicyEngine, PolicyError};
use parking_lot::RwLock;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use wildmatch::WildMatch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleAction {
    Direct,
    Proxy(SocketAddrV4),
}

impl RuleAction {
    fn answer(self, no_cache: bool) -> PolicyAnswer {
        let answer = match self {
            RuleAction::Direct => PolicyAnswer::direct(),
            RuleAction::Proxy(proxy) => PolicyAnswer::proxy(proxy),
        };
        PolicyAnswer { no_cache, ..answer }
    }
}

#[derive(Clone, Debug)]
pub enum HostMatcher {
    Any,
    /// Names without a dot.
    Plain,
    /// Wildcard pattern, case-insensitive.
    Pattern(WildMatch),
    /// The domain itself or anything below it.
    Domain(String),
    /// Numeric IPv4 hosts inside `network/mask`.
    Network { network: Ipv4Addr, mask: Ipv4Addr },
}

impl HostMatcher {
    pub fn pattern(pattern: &str) -> Self {
        HostMatcher::Pattern(WildMatch::new(&pattern.to_ascii_lowercase()))
    }

    pub fn domain(domain: &str) -> Self {
        HostMatcher::Domain(domain.trim_start_matches('.').to_ascii_lowercase())
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostMatcher::Any => true,
            HostMatcher::Plain => is_plain_host_name(host),
            HostMatcher::Pattern(matcher) => matcher.matches(&host.to_ascii_lowercase()),
            HostMatcher::Domain(domain) => is_host_in_domain(host, domain),
            HostMatcher::Network { network, mask } => host
                .parse::<Ipv4Addr>()
                .map(|ip| is_in_network(ip, *network, *mask))
                .unwrap_or(false),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PolicyRule {
    pub id: u64,
    application: Option<WildMatch>,
    host: HostMatcher,
    pub action: RuleAction,
}

impl PolicyRule {
    fn matches(&self, application: &str, host: &str) -> bool {
        self.application
            .as_ref()
            .map_or(true, |matcher| matcher.matches(application))
            && self.host.matches(host)
    }
}

/// First matching rule wins; `fallback` applies when nothing matches.
pub struct RulePolicy {
    rules: RwLock<Vec<PolicyRule>>,
    next_id: AtomicU64,
    fallback: RuleAction,
    no_cache: bool,
}

impl Default for RulePolicy {
    fn default() -> Self {
        Self::new(RuleAction::Direct)
    }
}

impl RulePolicy {
    pub fn new(fallback: RuleAction) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            fallback,
            no_cache: false,
        }
    }

    /// Answers are marked uncacheable, for rule sets that change at runtime.
    pub fn uncached(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn install_rule(
        &self,
        application: Option<&str>,
        host: HostMatcher,
        action: RuleAction,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.rules.write().push(PolicyRule {
            id,
            application: application.map(WildMatch::new),
            host,
            action,
        });
        id
    }

    pub fn remove_rule(&self, id: u64) -> bool {
        let mut guard = self.rules.write();
        let len_before = guard.len();
        guard.retain(|rule| rule.id != id);
        len_before != guard.len()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    pub fn decide(&self, application: &str, host: &str) -> RuleAction {
        self.rules
            .read()
            .iter()
            .find(|rule| rule.matches(application, host))
            .map(|rule| rule.action)
            .unwrap_or(self.fallback)
    }
}

impl PolicyEngine for RulePolicy {
    fn evaluate(
        &self,
        application: &str,
        name: &str,
        _port: u16,
    ) -> Result<PolicyAnswer, PolicyError> {
        Ok(self.decide(application, name).answer(self.no_cache))
    }
}

pub fn is_plain_host_name(host: &str) -> bool {
    !host.contains('.')
}

pub fn host_domain_level(host: &str) -> usize {
    host.matches('.').count()
}

/// Case-insensitive suffix test on label boundaries.
pub fn is_host_in_domain(host: &str, domain: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    host == domain
        || host
            .strip_suffix(&domain)
            .is_some_and(|head| head.ends_with('.'))
}

pub fn is_in_network(address: Ipv4Addr, network: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let mask = u32::from(mask);
    (u32::from(address) & mask) == (u32::from(network) & mask)
}
