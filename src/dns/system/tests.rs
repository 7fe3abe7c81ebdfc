use super::*;

#[test]
fn rejects_empty_hosts() {
    let resolver = SystemResolver::default();
    assert!(matches!(
        resolver.resolve("", 80),
        Err(ResolveError::Unsupported)
    ));
}

#[test]
fn rejects_overlong_hosts() {
    let resolver = SystemResolver::default();
    let host = "a".repeat(MAX_HOST_LENGTH + 1);
    assert!(matches!(
        resolver.resolve(&host, 80),
        Err(ResolveError::Unsupported)
    ));
}

#[test]
fn resolves_ip_literals_with_port() {
    let resolver = SystemResolver::default();
    let result = resolver.resolve("2001:4860:4860::8888", 853).unwrap();
    assert_eq!(
        result.as_slice(),
        &["[2001:4860:4860::8888]:853".parse::<SocketAddr>().unwrap()]
    );
}

#[test]
fn resolves_localhost() {
    let resolver = SystemResolver::default();
    let result = resolver.resolve("localhost", 8080).unwrap();
    assert!(!result.is_empty());
    assert!(result.iter().all(|addr| addr.port() == 8080));
}

#[test]
fn cached_lookup_applies_requested_port() {
    let resolver = SystemResolver::default();
    resolver.resolve("localhost", 80).unwrap();
    let again = resolver.resolve("localhost", 443).unwrap();
    assert!(again.iter().all(|addr| addr.port() == 443));
    assert!(resolver.cache.read().contains_key("localhost"));
}
