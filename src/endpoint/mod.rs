//! Canonical connection targets.
//!
//! Every address that enters the router is funneled through [`Endpoint`] so
//! that IPv4-mapped IPv6 destinations are matched by the IPv4-only bypass and
//! synthetic-address logic downstream.

use crate::error::RouteError;
use std::fmt;
use std::mem::{size_of, zeroed};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    address: IpAddr,
    port: u16,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self::normalize(&SocketAddr::new(address, port))
    }

    /// Collapses `::ffff:a.b.c.d` onto its embedded IPv4 address; any other
    /// IPv6 address is kept as-is.
    pub fn normalize(target: &SocketAddr) -> Self {
        let address = match target.ip() {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };
        Self {
            address,
            port: target.port(),
        }
    }

    /// Reads a raw socket address handed over by the interception layer.
    ///
    /// # Safety
    /// `addr` must be null or point to at least `len` readable bytes.
    pub unsafe fn from_raw(
        addr: *const libc::sockaddr,
        len: libc::socklen_t,
    ) -> Result<Self, RouteError> {
        let target = unsafe { socket_addr_from_raw(addr, len) }?;
        Ok(Self::normalize(&target))
    }

    pub fn ip(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.address {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

/// # Safety
/// `addr` must be null or point to at least `len` readable bytes.
pub unsafe fn socket_addr_from_raw(
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
) -> Result<SocketAddr, RouteError> {
    let Some(header) = (unsafe { addr.as_ref() }) else {
        return Err(RouteError::InvalidEndpoint { family: -1 });
    };
    let family = i32::from(header.sa_family);
    let len = len as usize;
    match family {
        libc::AF_INET if len >= size_of::<libc::sockaddr_in>() => {
            let raw = unsafe { &*(addr as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(raw.sin_port))))
        }
        libc::AF_INET6 if len >= size_of::<libc::sockaddr_in6>() => {
            let raw = unsafe { &*(addr as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(raw.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(raw.sin6_port),
                raw.sin6_flowinfo,
                raw.sin6_scope_id,
            )))
        }
        _ => Err(RouteError::InvalidEndpoint { family }),
    }
}

/// Builds the `sockaddr` representation the C socket calls expect.
pub fn socket_addr_to_raw(target: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
    let len = match target {
        SocketAddr::V4(v4) => {
            let raw = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            raw.sin_family = libc::AF_INET as libc::sa_family_t;
            raw.sin_port = v4.port().to_be();
            raw.sin_addr = libc::in_addr {
                s_addr: u32::from(*v4.ip()).to_be(),
            };
            #[cfg(any(target_os = "macos", target_os = "ios"))]
            {
                raw.sin_len = size_of::<libc::sockaddr_in>() as u8;
            }
            size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let raw = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            raw.sin6_port = v6.port().to_be();
            raw.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            raw.sin6_flowinfo = v6.flowinfo();
            raw.sin6_scope_id = v6.scope_id();
            #[cfg(any(target_os = "macos", target_os = "ios"))]
            {
                raw.sin6_len = size_of::<libc::sockaddr_in6>() as u8;
            }
            size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}
