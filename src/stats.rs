use crate::ffi::RouteCounters;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free tallies of routing outcomes, snapshotted for the C side.
#[derive(Debug, Default)]
pub struct RouteStats {
    bypassed: AtomicU64,
    direct: AtomicU64,
    proxied: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    policy_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug)]
pub enum RouteEvent {
    Bypassed,
    Direct,
    Proxied,
    Failed,
    CacheHit,
    CacheMiss,
    PolicyFailure,
}

impl RouteStats {
    pub fn record(&self, event: RouteEvent) {
        let counter = match event {
            RouteEvent::Bypassed => &self.bypassed,
            RouteEvent::Direct => &self.direct,
            RouteEvent::Proxied => &self.proxied,
            RouteEvent::Failed => &self.failed,
            RouteEvent::CacheHit => &self.cache_hits,
            RouteEvent::CacheMiss => &self.cache_misses,
            RouteEvent::PolicyFailure => &self.policy_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RouteCounters {
        RouteCounters {
            bypassed: self.bypassed.load(Ordering::Relaxed),
            direct: self.direct.load(Ordering::Relaxed),
            proxied: self.proxied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            policy_failures: self.policy_failures.load(Ordering::Relaxed),
        }
    }
}
