use super::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
fn first_name_gets_first_host_address() {
    let table = ResolveTable::default();
    assert_eq!(table.name_to_address("example.com"), Ipv4Addr::new(240, 0, 0, 1));
    assert_eq!(table.name_to_address("example.org"), Ipv4Addr::new(240, 0, 0, 2));
}

#[test]
fn lookup_is_stable_for_known_names() {
    let table = ResolveTable::default();
    let first = table.name_to_address("api.example.com");
    table.name_to_address("cdn.example.com");
    assert_eq!(table.name_to_address("api.example.com"), first);
    assert_eq!(table.len(), 2);
}

#[test]
fn address_maps_back_to_name() {
    let table = ResolveTable::default();
    let address = table.name_to_address("video.example.net");
    assert_eq!(table.address_to_name(address).as_deref(), Some("video.example.net"));
}

#[test]
fn distinct_names_never_share_addresses() {
    let table = ResolveTable::new(DEFAULT_PREFIX, 64);
    let addresses: HashSet<Ipv4Addr> = (0..64)
        .map(|idx| table.name_to_address(&format!("host{idx}.test")))
        .collect();
    assert_eq!(addresses.len(), 64);
}

#[test]
fn unknown_or_foreign_addresses_resolve_to_nothing() {
    let table = ResolveTable::default();
    table.name_to_address("bound.test");
    assert_eq!(table.address_to_name(Ipv4Addr::new(240, 0, 0, 9)), None);
    assert_eq!(table.address_to_name(Ipv4Addr::new(240, 0, 0, 0)), None);
    assert_eq!(table.address_to_name(Ipv4Addr::new(8, 8, 8, 8)), None);
}

#[test]
fn synthetic_check_only_looks_at_prefix() {
    let table = ResolveTable::default();
    assert!(table.is_synthetic_address(Ipv4Addr::new(240, 1, 2, 3)));
    assert!(!table.is_synthetic_address(Ipv4Addr::new(241, 0, 0, 1)));
}

#[test]
fn full_table_evicts_in_rotation_order() {
    let table = ResolveTable::new(DEFAULT_PREFIX, 3);
    let a = table.name_to_address("a.test");
    let b = table.name_to_address("b.test");
    table.name_to_address("c.test");
    // Touching "a" again does not protect it: eviction is not recency based.
    assert_eq!(table.name_to_address("a.test"), a);

    let d = table.name_to_address("d.test");
    assert_eq!(d, a);
    assert_eq!(table.address_to_name(a).as_deref(), Some("d.test"));
    assert_eq!(table.address_to_name(b).as_deref(), Some("b.test"));
    assert_eq!(table.len(), 3);

    let e = table.name_to_address("e.test");
    assert_eq!(e, b);
    assert_eq!(table.address_to_name(b).as_deref(), Some("e.test"));

    // The evicted name is rebound to a fresh slot on its next lookup.
    let a_again = table.name_to_address("a.test");
    assert_ne!(a_again, table.name_to_address("d.test"));
    assert_eq!(table.address_to_name(a_again).as_deref(), Some("a.test"));
}

#[test]
fn addresses_past_capacity_are_not_bound() {
    let table = ResolveTable::new(DEFAULT_PREFIX, 2);
    table.name_to_address("a.test");
    table.name_to_address("b.test");
    assert_eq!(table.address_to_name(Ipv4Addr::new(240, 0, 0, 3)), None);
}

#[test]
fn custom_prefix_is_honored() {
    let table = ResolveTable::new(198, 16);
    let address = table.name_to_address("prefixed.test");
    assert_eq!(address.octets()[0], 198);
    assert!(table.is_synthetic_address(address));
}

#[test]
fn concurrent_allocation_keeps_bijection() {
    let table = Arc::new(ResolveTable::new(DEFAULT_PREFIX, 4096));
    let mut workers = Vec::new();
    for worker in 0..8 {
        let table = Arc::clone(&table);
        workers.push(thread::spawn(move || {
            let mut seen = Vec::new();
            for idx in 0..256 {
                // Half of the names are shared between all workers.
                let name = if idx % 2 == 0 {
                    format!("shared{idx}.test")
                } else {
                    format!("w{worker}-{idx}.test")
                };
                seen.push((name.clone(), table.name_to_address(&name)));
            }
            seen
        }));
    }
    let mut bindings = std::collections::HashMap::new();
    for worker in workers {
        for (name, address) in worker.join().unwrap() {
            let previous = bindings.insert(name.clone(), address);
            if let Some(previous) = previous {
                assert_eq!(previous, address, "{name} bound twice");
            }
        }
    }
    let unique: HashSet<Ipv4Addr> = bindings.values().copied().collect();
    assert_eq!(unique.len(), bindings.len());
    assert_eq!(table.len(), bindings.len());
    for (name, address) in bindings {
        assert_eq!(table.address_to_name(address), Some(name));
    }
}
