//! Synthetic ("fake") address space for names that must be resolved by the
//! proxy instead of the system resolver.
//!
//! A name is bound to an index in `[0, capacity)`; the index `i` is published
//! as `prefix.<24 bits of i + 1>` so the all-zero host part never appears.
//! The mapping is a bijection over live entries. Once the table is full the
//! allocation cursor wraps and evicts whatever name owns the next index.

use crate::logger::{self, BreadcrumbFlags};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::net::Ipv4Addr;

pub const DEFAULT_PREFIX: u8 = 240;
const HOST_BITS: u32 = 24;
const HOST_MASK: u32 = (1 << HOST_BITS) - 1;
pub const MAX_CAPACITY: usize = HOST_MASK as usize;

#[derive(Debug, Default)]
struct TableInner {
    names: FxHashMap<String, usize>,
    indices: FxHashMap<usize, String>,
    cursor: usize,
}

#[derive(Debug)]
pub struct ResolveTable {
    inner: RwLock<TableInner>,
    prefix: u8,
    capacity: usize,
}

impl Default for ResolveTable {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX, MAX_CAPACITY)
    }
}

impl ResolveTable {
    /// `capacity` is clamped into `1..=MAX_CAPACITY`.
    pub fn new(prefix: u8, capacity: usize) -> Self {
        Self {
            inner: RwLock::new(TableInner::default()),
            prefix,
            capacity: capacity.clamp(1, MAX_CAPACITY),
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the synthetic address bound to `name`, allocating one if needed.
    pub fn name_to_address(&self, name: &str) -> Ipv4Addr {
        if let Some(index) = self.inner.read().names.get(name).copied() {
            return self.index_to_address(index);
        }
        let index = self.allocate(name);
        self.index_to_address(index)
    }

    /// Reverse lookup; `None` when the address is outside the block or its
    /// index has no live binding.
    pub fn address_to_name(&self, address: Ipv4Addr) -> Option<String> {
        let index = self.address_to_index(address)?;
        self.inner.read().indices.get(&index).cloned()
    }

    /// True when the leading byte matches the reserved prefix, bound or not.
    pub fn is_synthetic_address(&self, address: Ipv4Addr) -> bool {
        address.octets()[0] == self.prefix
    }

    fn allocate(&self, name: &str) -> usize {
        let mut guard = self.inner.write();
        // Another caller may have bound the name between our read and write.
        if let Some(index) = guard.names.get(name).copied() {
            return index;
        }
        let index = guard.cursor;
        if let Some(evicted) = guard.indices.remove(&index) {
            guard.names.remove(&evicted);
            logger::breadcrumb(
                BreadcrumbFlags::DNS,
                format!("resolve table evicted {evicted} from slot {index}"),
            );
        }
        guard.names.insert(name.to_string(), index);
        guard.indices.insert(index, name.to_string());
        guard.cursor = (index + 1) % self.capacity;
        index
    }

    fn index_to_address(&self, index: usize) -> Ipv4Addr {
        let host = (index as u32 + 1) & HOST_MASK;
        Ipv4Addr::from((u32::from(self.prefix) << HOST_BITS) | host)
    }

    fn address_to_index(&self, address: Ipv4Addr) -> Option<usize> {
        if !self.is_synthetic_address(address) {
            return None;
        }
        let host = u32::from(address) & HOST_MASK;
        let index = host.checked_sub(1)? as usize;
        (index < self.capacity).then_some(index)
    }
}

#[cfg(test)]
mod tests;
