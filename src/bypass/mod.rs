//! Destinations that are never routed: loopback, private networks and the
//! local machine's own names.

use crate::endpoint::Endpoint;
use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BypassRule {
    pub network: Ipv4Addr,
    pub mask: Ipv4Addr,
    /// 0 matches any port.
    pub port: u16,
}

impl BypassRule {
    pub const fn new(network: Ipv4Addr, mask: Ipv4Addr, port: u16) -> Self {
        Self {
            network,
            mask,
            port,
        }
    }

    pub fn matches(&self, address: Ipv4Addr, port: u16) -> bool {
        let mask = u32::from(self.mask);
        (u32::from(address) & mask) == (u32::from(self.network) & mask)
            && (self.port == 0 || self.port == port)
    }
}

pub const DEFAULT_RULES: [BypassRule; 4] = [
    // loopback
    BypassRule::new(Ipv4Addr::new(127, 0, 0, 0), Ipv4Addr::new(255, 0, 0, 0), 0),
    // private networks
    BypassRule::new(Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(255, 0, 0, 0), 0),
    BypassRule::new(Ipv4Addr::new(172, 16, 0, 0), Ipv4Addr::new(255, 240, 0, 0), 0),
    BypassRule::new(Ipv4Addr::new(192, 168, 0, 0), Ipv4Addr::new(255, 255, 0, 0), 0),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv6BypassRule {
    pub network: Ipv6Addr,
    pub prefix_len: u8,
}

impl Ipv6BypassRule {
    pub const fn new(network: Ipv6Addr, prefix_len: u8) -> Self {
        Self {
            network,
            prefix_len,
        }
    }

    pub fn matches(&self, address: Ipv6Addr) -> bool {
        let bits = u32::from(self.prefix_len.min(128));
        if bits == 0 {
            return true;
        }
        let mask = u128::MAX << (128 - bits);
        (u128::from(address) & mask) == (u128::from(self.network) & mask)
    }
}

pub const DEFAULT_IPV6_RULES: [Ipv6BypassRule; 3] = [
    Ipv6BypassRule::new(Ipv6Addr::LOCALHOST, 128),
    // unique local
    Ipv6BypassRule::new(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    // link local
    Ipv6BypassRule::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
];

/// How IPv6 endpoints are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Ipv6Bypass {
    /// Every IPv6 endpoint bypasses routing.
    #[default]
    All,
    /// Only endpoints inside the IPv6 rule table bypass.
    Rules,
}

#[derive(Clone, Debug)]
pub struct BypassRules {
    rules: Vec<BypassRule>,
    ipv6_rules: Vec<Ipv6BypassRule>,
    ipv6: Ipv6Bypass,
}

impl Default for BypassRules {
    fn default() -> Self {
        Self::new(DEFAULT_RULES.to_vec(), Ipv6Bypass::All)
    }
}

impl BypassRules {
    pub fn new(rules: Vec<BypassRule>, ipv6: Ipv6Bypass) -> Self {
        Self {
            rules,
            ipv6_rules: DEFAULT_IPV6_RULES.to_vec(),
            ipv6,
        }
    }

    pub fn with_ipv6_rules(mut self, rules: Vec<Ipv6BypassRule>) -> Self {
        self.ipv6_rules = rules;
        self
    }

    pub fn rules(&self) -> &[BypassRule] {
        &self.rules
    }

    pub fn should_bypass_endpoint(&self, endpoint: &Endpoint) -> bool {
        match endpoint.ip() {
            IpAddr::V4(v4) => self
                .rules
                .iter()
                .any(|rule| rule.matches(v4, endpoint.port())),
            IpAddr::V6(v6) => match self.ipv6 {
                Ipv6Bypass::All => true,
                Ipv6Bypass::Rules => self.ipv6_rules.iter().any(|rule| rule.matches(v6)),
            },
        }
    }

    /// Name-level exemptions; `service` is accepted for call-site parity with
    /// the resolution primitives but does not influence the result.
    pub fn should_bypass_name(&self, name: &str, _service: Option<&str>) -> bool {
        if name.is_empty() || parse_numeric_host(name).is_some() {
            return true;
        }
        if name.eq_ignore_ascii_case("localhost") {
            return true;
        }
        local_hostname().is_some_and(|local| local == name)
    }
}

/// Recognises the numeric host forms the C resolver accepts without a
/// lookup: IPv6 text, and IPv4 in `inet_aton` notation (one to four parts,
/// each decimal, octal with a leading `0` or hex with `0x`, the last part
/// filling the remaining bytes). Text after the first whitespace is ignored,
/// as `inet_aton` does.
pub fn parse_numeric_host(name: &str) -> Option<IpAddr> {
    if let Ok(v6) = name.parse::<Ipv6Addr>() {
        return Some(IpAddr::V6(v6));
    }
    let text = name
        .split(|c: char| c.is_ascii_whitespace())
        .next()
        .unwrap_or_default();
    let mut parts = [0u32; 4];
    let mut count = 0;
    for part in text.split('.') {
        if count == parts.len() {
            return None;
        }
        parts[count] = parse_aton_part(part)?;
        count += 1;
    }
    let (head, last) = (&parts[..count - 1], parts[count - 1]);
    if head.iter().any(|&part| part > 0xff) {
        return None;
    }
    // Bits left for the final part once the leading bytes are placed.
    let last_bits = 32 - 8 * head.len() as u32;
    if last_bits < 32 && last >> last_bits != 0 {
        return None;
    }
    let value = head
        .iter()
        .enumerate()
        .fold(last, |value, (index, &part)| value | (part << (24 - 8 * index)));
    Some(IpAddr::V4(Ipv4Addr::from(value)))
}

fn parse_aton_part(part: &str) -> Option<u32> {
    let (digits, radix) = if let Some(hex) = part
        .strip_prefix("0x")
        .or_else(|| part.strip_prefix("0X"))
    {
        (hex, 16)
    } else if part.len() > 1 && part.starts_with('0') {
        (&part[1..], 8)
    } else {
        (part, 10)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u32::from_str_radix(digits, radix).ok()
}

pub fn local_hostname() -> Option<String> {
    let mut buffer = [0 as libc::c_char; 256];
    let status = unsafe { libc::gethostname(buffer.as_mut_ptr(), buffer.len()) };
    if status != 0 {
        return None;
    }
    // gethostname may not terminate a truncated name.
    buffer[buffer.len() - 1] = 0;
    let name = unsafe { CStr::from_ptr(buffer.as_ptr()) };
    let name = name.to_string_lossy();
    (!name.is_empty()).then(|| name.into_owned())
}
