use super::*;
use crate::dns::ResolveError;
use socks5::ReplyCode;
use crossbeam_channel::{unbounded, Receiver};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

/// Resolves every name to loopback.
struct LoopbackResolver;

impl Resolver for LoopbackResolver {
    fn resolve(&self, host: &str, port: u16) -> Result<Candidates, ResolveError> {
        if host == "missing.test" {
            return Err(ResolveError::LookupFailed("no such host".into()));
        }
        Ok(Candidates::from_elem(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            1,
        ))
    }
}

fn establisher(table: Arc<ResolveTable>, timeout: Duration) -> Establisher {
    Establisher::new(table, Arc::new(LoopbackResolver), timeout)
}

struct MockProxy {
    address: SocketAddrV4,
    requests: Receiver<Vec<u8>>,
    handle: JoinHandle<()>,
}

/// One-shot SOCKS5 server: answers the greeting with `method`, records the
/// CONNECT request and answers it with `reply`.
fn spawn_proxy(method: [u8; 2], reply: Vec<u8>) -> MockProxy {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = match listener.local_addr().unwrap() {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!(),
    };
    let (tx, requests) = unbounded();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        stream.write_all(&method).unwrap();
        if method != [0x05, 0x00] {
            return;
        }

        let mut request = vec![0u8; 4];
        stream.read_exact(&mut request).unwrap();
        let rest = match request[3] {
            0x01 => 4 + 2,
            0x04 => 16 + 2,
            _ => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).unwrap();
                request.push(len[0]);
                usize::from(len[0]) + 2
            }
        };
        let mut tail = vec![0u8; rest];
        stream.read_exact(&mut tail).unwrap();
        request.extend_from_slice(&tail);
        tx.send(request).unwrap();

        stream.write_all(&reply).unwrap();
        let mut drained = Vec::new();
        let _ = stream.read_to_end(&mut drained);
    });
    MockProxy {
        address,
        requests,
        handle,
    }
}

fn ipv4_success() -> Vec<u8> {
    vec![0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x1f, 0x90]
}

#[test]
fn proxied_dial_sends_ipv4_request() {
    let proxy = spawn_proxy([0x05, 0x00], ipv4_success());
    let table = Arc::new(ResolveTable::default());
    let target = Endpoint::new(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), 443);

    let fd = establisher(table, DEFAULT_DIAL_TIMEOUT)
        .establish(target, ProxyDecision::Socks5(proxy.address))
        .unwrap();

    let request = proxy.requests.recv().unwrap();
    assert_eq!(
        request,
        vec![0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xbb]
    );
    drop(fd);
    proxy.handle.join().unwrap();
}

#[test]
fn proxied_dial_sends_bound_name_for_synthetic_target() {
    let mut reply = ipv4_success();
    reply.extend_from_slice(b"payload");
    let proxy = spawn_proxy([0x05, 0x00], reply);
    let table = Arc::new(ResolveTable::default());
    let synthetic = table.name_to_address("example.com");

    let fd = establisher(table, DEFAULT_DIAL_TIMEOUT)
        .establish(
            Endpoint::new(IpAddr::V4(synthetic), 80),
            ProxyDecision::Socks5(proxy.address),
        )
        .unwrap();

    let mut expected = vec![0x05, 0x01, 0x00, 0x03, 11];
    expected.extend_from_slice(b"example.com");
    expected.extend_from_slice(&[0x00, 0x50]);
    assert_eq!(proxy.requests.recv().unwrap(), expected);

    // Only the reply is consumed; tunnelled bytes stay readable.
    let mut stream = TcpStream::from(fd);
    let mut payload = [0u8; 7];
    stream.read_exact(&mut payload).unwrap();
    assert_eq!(&payload, b"payload");
    drop(stream);
    proxy.handle.join().unwrap();
}

#[test]
fn proxied_dial_sends_ipv6_request() {
    let proxy = spawn_proxy([0x05, 0x00], ipv4_success());
    let table = Arc::new(ResolveTable::default());
    let target = Endpoint::new(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)), 443);

    let fd = establisher(table, DEFAULT_DIAL_TIMEOUT)
        .establish(target, ProxyDecision::Socks5(proxy.address))
        .unwrap();

    let request = proxy.requests.recv().unwrap();
    assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x04]);
    assert_eq!(request.len(), 4 + 16 + 2);
    drop(fd);
    proxy.handle.join().unwrap();
}

#[test]
fn domain_bound_address_is_drained() {
    let mut reply = vec![0x05, 0x00, 0x00, 0x03, 5];
    reply.extend_from_slice(b"proxy");
    reply.extend_from_slice(&[0x04, 0x38]);
    reply.extend_from_slice(b"XYZ");
    let proxy = spawn_proxy([0x05, 0x00], reply);
    let table = Arc::new(ResolveTable::default());

    let fd = establisher(table, DEFAULT_DIAL_TIMEOUT)
        .establish(
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 80),
            ProxyDecision::Socks5(proxy.address),
        )
        .unwrap();

    let mut stream = TcpStream::from(fd);
    let mut rest = [0u8; 3];
    stream.read_exact(&mut rest).unwrap();
    assert_eq!(&rest, b"XYZ");
    drop(stream);
    proxy.handle.join().unwrap();
}

#[test]
fn refused_reply_maps_to_dial_refused() {
    let proxy = spawn_proxy([0x05, 0x00], vec![0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    let table = Arc::new(ResolveTable::default());

    let error = establisher(table, DEFAULT_DIAL_TIMEOUT)
        .establish(
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 80),
            ProxyDecision::Socks5(proxy.address),
        )
        .unwrap_err();

    assert!(matches!(error, RouteError::DialRefused(_)), "{error:?}");
    proxy.handle.join().unwrap();
}

#[test]
fn general_failure_reply_is_proxy_rejection() {
    let proxy = spawn_proxy([0x05, 0x00], vec![0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    let table = Arc::new(ResolveTable::default());

    let error = establisher(table, DEFAULT_DIAL_TIMEOUT)
        .establish(
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 80),
            ProxyDecision::Socks5(proxy.address),
        )
        .unwrap_err();

    assert!(
        matches!(error, RouteError::ProxyRejected(ReplyCode::GeneralFailure)),
        "{error:?}"
    );
    proxy.handle.join().unwrap();
}

#[test]
fn authentication_demand_fails_negotiation() {
    let proxy = spawn_proxy([0x05, 0x02], Vec::new());
    let table = Arc::new(ResolveTable::default());

    let error = establisher(table, DEFAULT_DIAL_TIMEOUT)
        .establish(
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 80),
            ProxyDecision::Socks5(proxy.address),
        )
        .unwrap_err();

    assert!(matches!(error, RouteError::ProxyProtocol(_)), "{error:?}");
    proxy.handle.join().unwrap();
}

#[test]
fn silent_proxy_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let SocketAddr::V4(address) = listener.local_addr().unwrap() else {
        unreachable!()
    };
    let (release, released) = unbounded::<()>();
    let handle = thread::spawn(move || {
        let (_stream, _) = listener.accept().unwrap();
        let _ = released.recv();
    });
    let table = Arc::new(ResolveTable::default());

    let error = establisher(table, Duration::from_millis(200))
        .establish(
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 80),
            ProxyDecision::Socks5(address),
        )
        .unwrap_err();

    assert!(error.is_timeout(), "{error:?}");
    drop(release);
    handle.join().unwrap();
}

#[test]
fn unreachable_proxy_fails_without_hanging() {
    // Bind then drop to get a port nobody listens on.
    let address = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        match listener.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => unreachable!(),
        }
    };
    let table = Arc::new(ResolveTable::default());

    let error = establisher(table, Duration::from_secs(2))
        .establish(
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 80),
            ProxyDecision::Socks5(address),
        )
        .unwrap_err();

    assert!(matches!(error, RouteError::DialRefused(_)), "{error:?}");
}

#[test]
fn direct_dial_connects_to_literal_address() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let local = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"hello").unwrap();
    });
    let table = Arc::new(ResolveTable::default());

    let fd = establisher(table, DEFAULT_DIAL_TIMEOUT)
        .establish(Endpoint::normalize(&local), ProxyDecision::Direct)
        .unwrap();

    let mut stream = TcpStream::from(fd);
    let mut greeting = [0u8; 5];
    stream.read_exact(&mut greeting).unwrap();
    assert_eq!(&greeting, b"hello");
    handle.join().unwrap();
}

#[test]
fn direct_dial_resolves_synthetic_name() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"ok").unwrap();
    });
    let table = Arc::new(ResolveTable::default());
    let synthetic = table.name_to_address("service.test");

    let fd = establisher(table, DEFAULT_DIAL_TIMEOUT)
        .establish(Endpoint::new(IpAddr::V4(synthetic), port), ProxyDecision::Direct)
        .unwrap();

    let mut stream = TcpStream::from(fd);
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ok");
    handle.join().unwrap();
}

#[test]
fn direct_dial_reports_lookup_failure() {
    let table = Arc::new(ResolveTable::default());
    let synthetic = table.name_to_address("missing.test");

    let error = establisher(table, DEFAULT_DIAL_TIMEOUT)
        .establish(Endpoint::new(IpAddr::V4(synthetic), 80), ProxyDecision::Direct)
        .unwrap_err();

    assert!(matches!(error, RouteError::Resolve(_)), "{error:?}");
}

/// Answers from a fixed list, like a resolver returning several records.
struct FixedResolver(Vec<SocketAddr>);

impl Resolver for FixedResolver {
    fn resolve(&self, _host: &str, _port: u16) -> Result<Candidates, ResolveError> {
        Ok(self.0.iter().copied().collect())
    }
}

/// Resolves through the synthetic table, as a hooked lookup would.
struct LoopedResolver(Arc<ResolveTable>);

impl Resolver for LoopedResolver {
    fn resolve(&self, host: &str, port: u16) -> Result<Candidates, ResolveError> {
        let address = self.0.name_to_address(host);
        Ok(Candidates::from_elem(SocketAddr::new(IpAddr::V4(address), port), 1))
    }
}

fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[test]
fn direct_dial_falls_back_to_next_candidate() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let live = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(&[107]).unwrap();
    });
    let table = Arc::new(ResolveTable::default());
    let synthetic = table.name_to_address("multi.test");
    let resolver = FixedResolver(vec![closed_port(), live]);

    let fd = Establisher::new(table, Arc::new(resolver), DEFAULT_DIAL_TIMEOUT)
        .establish(Endpoint::new(IpAddr::V4(synthetic), live.port()), ProxyDecision::Direct)
        .unwrap();

    let mut stream = TcpStream::from(fd);
    let mut reply = [0u8; 1];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [107]);
    handle.join().unwrap();
}

#[test]
fn direct_dial_skips_synthetic_candidates() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let live = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"real").unwrap();
    });
    let table = Arc::new(ResolveTable::default());
    let synthetic = table.name_to_address("mixed.test");
    let placeholder = SocketAddr::new(IpAddr::V4(synthetic), live.port());
    let resolver = FixedResolver(vec![placeholder, live]);

    let fd = Establisher::new(table, Arc::new(resolver), DEFAULT_DIAL_TIMEOUT)
        .establish(Endpoint::new(IpAddr::V4(synthetic), live.port()), ProxyDecision::Direct)
        .unwrap();

    let mut stream = TcpStream::from(fd);
    assert_eq!(stream.peer_addr().unwrap(), live);
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"real");
    handle.join().unwrap();
}

#[test]
fn looped_lookup_never_dials_placeholder() {
    let table = Arc::new(ResolveTable::default());
    let synthetic = table.name_to_address("looped.test");
    let resolver = LoopedResolver(table.clone());

    let error = Establisher::new(table, Arc::new(resolver), DEFAULT_DIAL_TIMEOUT)
        .establish(Endpoint::new(IpAddr::V4(synthetic), 80), ProxyDecision::Direct)
        .unwrap_err();

    assert!(
        matches!(error, RouteError::StaleSyntheticAddress(address) if address == synthetic),
        "{error:?}"
    );
}

#[test]
fn peer_closing_mid_handshake_is_peer_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let SocketAddr::V4(address) = listener.local_addr().unwrap() else {
        unreachable!()
    };
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).unwrap();
        stream.write_all(&[0x05]).unwrap();
    });
    let table = Arc::new(ResolveTable::default());

    let error = establisher(table, DEFAULT_DIAL_TIMEOUT)
        .establish(
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 80),
            ProxyDecision::Socks5(address),
        )
        .unwrap_err();

    assert!(matches!(error, RouteError::PeerClosed), "{error:?}");
    handle.join().unwrap();
}

#[test]
fn unbound_synthetic_address_is_stale_on_both_paths() {
    let table = Arc::new(ResolveTable::default());
    let unbound = Ipv4Addr::new(240, 0, 0, 9);
    let establisher = establisher(table, DEFAULT_DIAL_TIMEOUT);
    let proxy = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);

    for decision in [ProxyDecision::Direct, ProxyDecision::Socks5(proxy)] {
        let error = establisher
            .establish(Endpoint::new(IpAddr::V4(unbound), 80), decision)
            .unwrap_err();
        assert!(
            matches!(error, RouteError::StaleSyntheticAddress(address) if address == unbound),
            "{error:?}"
        );
    }
}

#[test]
fn framing_rejects_oversized_domain() {
    let name = "a".repeat(socks5::MAX_DOMAIN_LEN + 1);
    let error = socks5::connect_request(&TargetAddr::Domain(&name), 80).unwrap_err();
    assert!(matches!(error, RouteError::ProxyProtocol(_)));
    assert!(socks5::connect_request(&TargetAddr::Domain(""), 80).is_err());
    let longest = "b".repeat(socks5::MAX_DOMAIN_LEN);
    let request = socks5::connect_request(&TargetAddr::Domain(&longest), 80).unwrap();
    assert_eq!(request.len(), 4 + 1 + 255 + 2);
}

#[test]
fn reply_header_shapes() {
    assert_eq!(
        socks5::parse_reply_header([0x05, 0x00, 0x00, 0x01]).unwrap(),
        BoundAddress::Fixed(6)
    );
    assert_eq!(
        socks5::parse_reply_header([0x05, 0x00, 0x00, 0x04]).unwrap(),
        BoundAddress::Fixed(18)
    );
    assert_eq!(
        socks5::parse_reply_header([0x05, 0x00, 0x00, 0x03]).unwrap(),
        BoundAddress::Domain
    );
    assert_eq!(BoundAddress::Domain.remaining(5), 7);
    assert!(matches!(
        socks5::parse_reply_header([0x04, 0x00, 0x00, 0x01]),
        Err(RouteError::ProxyProtocol(_))
    ));
    assert!(matches!(
        socks5::parse_reply_header([0x05, 0x00, 0x00, 0x09]),
        Err(RouteError::ProxyProtocol(_))
    ));
    assert!(matches!(
        socks5::parse_reply_header([0x05, 0x04, 0x00, 0x01]),
        Err(RouteError::DialUnreachable(_))
    ));
}
