//! SOCKS5 client framing (RFC 1928 CONNECT, no authentication).

use crate::error::RouteError;
use smallvec::SmallVec;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const RESERVED: u8 = 0x00;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const MAX_DOMAIN_LEN: usize = u8::MAX as usize;

/// Inline for every request but the longest names; a 255-byte name needs
/// 4 header + 1 length + 255 name + 2 port and spills to the heap.
pub type RequestBuffer = SmallVec<[u8; 256]>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetAddr<'a> {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(&'a str),
}

impl TargetAddr<'_> {
    pub fn address_type(&self) -> u8 {
        match self {
            TargetAddr::Ipv4(_) => ATYP_IPV4,
            TargetAddr::Domain(_) => ATYP_DOMAIN,
            TargetAddr::Ipv6(_) => ATYP_IPV6,
        }
    }
}

impl fmt::Display for TargetAddr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => ip.fmt(f),
            TargetAddr::Ipv6(ip) => write!(f, "[{ip}]"),
            TargetAddr::Domain(name) => f.write_str(name),
        }
    }
}

pub fn greeting() -> [u8; 3] {
    [VERSION, 1, METHOD_NO_AUTH]
}

pub fn check_method_reply(reply: [u8; 2]) -> Result<(), RouteError> {
    if reply[0] != VERSION {
        return Err(RouteError::ProxyProtocol(format!(
            "invalid proxy version {}",
            reply[0]
        )));
    }
    if reply[1] != METHOD_NO_AUTH {
        return Err(RouteError::ProxyProtocol(
            "proxy authentication required".into(),
        ));
    }
    Ok(())
}

pub fn connect_request(target: &TargetAddr<'_>, port: u16) -> Result<RequestBuffer, RouteError> {
    let mut request = RequestBuffer::new();
    request.extend_from_slice(&[VERSION, CMD_CONNECT, RESERVED, target.address_type()]);
    match target {
        TargetAddr::Ipv4(ip) => request.extend_from_slice(&ip.octets()),
        TargetAddr::Ipv6(ip) => request.extend_from_slice(&ip.octets()),
        TargetAddr::Domain(name) => {
            if name.is_empty() || name.len() > MAX_DOMAIN_LEN {
                return Err(RouteError::ProxyProtocol(format!(
                    "domain name of {} bytes cannot be sent",
                    name.len()
                )));
            }
            request.push(name.len() as u8);
            request.extend_from_slice(name.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded,
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unknown(u8),
}

impl ReplyCode {
    pub fn from_byte(code: u8) -> Self {
        match code {
            0x00 => ReplyCode::Succeeded,
            0x01 => ReplyCode::GeneralFailure,
            0x02 => ReplyCode::NotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            other => ReplyCode::Unknown(other),
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyCode::Succeeded => f.write_str("succeeded"),
            ReplyCode::GeneralFailure => f.write_str("general failure"),
            ReplyCode::NotAllowed => f.write_str("connection not allowed"),
            ReplyCode::NetworkUnreachable => f.write_str("network unreachable"),
            ReplyCode::HostUnreachable => f.write_str("host unreachable"),
            ReplyCode::ConnectionRefused => f.write_str("connection refused"),
            ReplyCode::TtlExpired => f.write_str("ttl expired"),
            ReplyCode::CommandNotSupported => f.write_str("command not supported"),
            ReplyCode::AddressTypeNotSupported => f.write_str("address type not supported"),
            ReplyCode::Unknown(code) => write!(f, "unknown error {code}"),
        }
    }
}

/// Shape of the bound address that trails a reply header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundAddress {
    /// Address and port of a fixed total size.
    Fixed(usize),
    /// One length byte, then that many name bytes and the port.
    Domain,
}

impl BoundAddress {
    /// Bytes left to drain once the domain length byte (if any) is known.
    pub fn remaining(&self, domain_len: u8) -> usize {
        match self {
            BoundAddress::Fixed(len) => *len,
            BoundAddress::Domain => usize::from(domain_len) + 2,
        }
    }
}

/// Validates the 4-byte reply header and describes what follows it.
pub fn parse_reply_header(header: [u8; 4]) -> Result<BoundAddress, RouteError> {
    if header[0] != VERSION {
        return Err(RouteError::ProxyProtocol(format!(
            "invalid proxy version {}",
            header[0]
        )));
    }
    let code = ReplyCode::from_byte(header[1]);
    if code != ReplyCode::Succeeded {
        return Err(RouteError::from_reply(code));
    }
    match header[3] {
        ATYP_IPV4 => Ok(BoundAddress::Fixed(4 + 2)),
        ATYP_DOMAIN => Ok(BoundAddress::Domain),
        ATYP_IPV6 => Ok(BoundAddress::Fixed(16 + 2)),
        other => Err(RouteError::ProxyProtocol(format!(
            "replied address type {other} not supported"
        ))),
    }
}
