use super::{Candidates, ResolveError, Resolver};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

const MAX_CACHE_ENTRIES: usize = 512;
const MAX_HOST_LENGTH: usize = 255;
const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct CacheEntry {
    expires_at: Instant,
    addresses: Vec<IpAddr>,
}

/// Blocking resolver backed by the platform `getaddrinfo`.
/// A short-lived cache keeps repeated dials to one name off the system DNS.
#[derive(Debug)]
pub struct SystemResolver {
    cache: RwLock<HashMap<String, CacheEntry>>,
    order: RwLock<VecDeque<String>>,
    ttl: Duration,
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl SystemResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            order: RwLock::new(VecDeque::new()),
            ttl: ttl.max(Duration::from_secs(1)),
        }
    }

    fn cache_lookup(&self, host: &str) -> Option<Vec<IpAddr>> {
        let now = Instant::now();
        if let Some(entry) = self.cache.read().get(host) {
            if entry.expires_at > now {
                return Some(entry.addresses.clone());
            }
        } else {
            return None;
        }
        let mut cache = self.cache.write();
        if cache.get(host).is_some_and(|entry| entry.expires_at <= now) {
            cache.remove(host);
            drop(cache);
            self.order.write().retain(|entry| entry != host);
        }
        None
    }

    fn cache_insert(&self, host: &str, addresses: &[IpAddr]) {
        if addresses.is_empty() {
            return;
        }
        self.cache.write().insert(
            host.to_string(),
            CacheEntry {
                expires_at: Instant::now() + self.ttl,
                addresses: addresses.to_vec(),
            },
        );
        let mut evicted = Vec::new();
        {
            let mut order = self.order.write();
            order.retain(|entry| entry != host);
            order.push_back(host.to_string());
            while order.len() > MAX_CACHE_ENTRIES {
                if let Some(oldest) = order.pop_front() {
                    evicted.push(oldest);
                }
            }
        }
        if !evicted.is_empty() {
            let mut cache = self.cache.write();
            for key in evicted {
                cache.remove(&key);
            }
        }
    }

    fn query_system(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let iter = (host, 0)
            .to_socket_addrs()
            .map_err(|error| ResolveError::LookupFailed(error.to_string()))?;
        let mut results: Vec<IpAddr> = Vec::new();
        for socket in iter {
            if !results.contains(&socket.ip()) {
                results.push(socket.ip());
            }
        }
        if results.is_empty() {
            Err(ResolveError::LookupFailed(
                "resolver returned no addresses".into(),
            ))
        } else {
            Ok(results)
        }
    }
}

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> Result<Candidates, ResolveError> {
        let trimmed = host.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_HOST_LENGTH {
            return Err(ResolveError::Unsupported);
        }
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Candidates::from_elem(SocketAddr::new(ip, port), 1));
        }
        let addresses = match self.cache_lookup(trimmed) {
            Some(cached) => cached,
            None => {
                let fresh = self.query_system(trimmed)?;
                self.cache_insert(trimmed, &fresh);
                fresh
            }
        };
        Ok(addresses
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect())
    }
}

#[cfg(test)]
mod tests;
