use crate::bypass::{BypassRules, Ipv6Bypass, DEFAULT_RULES};
use crate::dns::{Candidates, ResolveError, Resolver};
use crate::endpoint::socket_addr_from_raw;
use crate::establish::DEFAULT_DIAL_TIMEOUT;
use crate::policy::{PolicyAnswer, PolicyEngine, PolicyError};
use crate::resolve_table::{DEFAULT_PREFIX, MAX_CAPACITY};
use crate::router::RouterConfig;
use std::ffi::{c_char, c_void, CStr, CString};
use std::time::Duration;

pub const BRIDGE_CONNECT_PASSTHROUGH: i32 = 1;
pub const BRIDGE_MAX_PROXY_HOST: usize = 64;
/// Slots offered to the resolve callback per lookup.
pub const BRIDGE_MAX_RESOLVED: usize = 8;

const MIN_TIMEOUT_MS: u32 = 100;
const MAX_TIMEOUT_MS: u32 = 120_000;

pub type PolicyEvaluateFn = unsafe extern "C" fn(
    application: *const c_char,
    name: *const c_char,
    port: u16,
    answer: *mut BridgePolicyAnswer,
    context: *mut c_void,
) -> bool;

/// Writes up to `capacity` addresses for `host` into `out` and returns how
/// many it wrote, or a negative value when the lookup failed.
pub type ResolveFn = unsafe extern "C" fn(
    host: *const c_char,
    port: u16,
    out: *mut libc::sockaddr_storage,
    capacity: usize,
    context: *mut c_void,
) -> i32;

/// Mirror of the `BridgeConfig` struct defined in `include/bridge.h`.
/// Zero fields fall back to defaults.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct BridgeConfig {
    pub dial_timeout_ms: u32,
    pub synthetic_prefix: u8,
    pub table_capacity: u32,
    /// Non-zero evaluates the IPv6 bypass table instead of exempting all IPv6.
    pub ipv6_bypass_rules: bool,
    /// Optional identity for policy queries; the process name when null.
    pub application: *const c_char,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT.as_millis() as u32,
            synthetic_prefix: DEFAULT_PREFIX,
            table_capacity: MAX_CAPACITY as u32,
            ipv6_bypass_rules: false,
            application: std::ptr::null(),
        }
    }
}

impl BridgeConfig {
    /// # Safety
    /// `application` must be null or a valid NUL-terminated string.
    pub unsafe fn to_router_config(&self) -> RouterConfig {
        let defaults = RouterConfig::default();
        let dial_timeout = match self.dial_timeout_ms {
            0 => defaults.dial_timeout,
            ms => Duration::from_millis(u64::from(ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS))),
        };
        let synthetic_prefix = match self.synthetic_prefix {
            0 => DEFAULT_PREFIX,
            prefix => prefix,
        };
        let table_capacity = match self.table_capacity {
            0 => MAX_CAPACITY,
            capacity => (capacity as usize).min(MAX_CAPACITY),
        };
        let ipv6 = if self.ipv6_bypass_rules {
            Ipv6Bypass::Rules
        } else {
            Ipv6Bypass::All
        };
        let application = unsafe { c_str(self.application) }
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or(defaults.application);
        RouterConfig {
            dial_timeout,
            synthetic_prefix,
            table_capacity,
            bypass: BypassRules::new(DEFAULT_RULES.to_vec(), ipv6),
            application,
        }
    }
}

/// Filled in by the policy callback. An empty `host` means "connect
/// directly".
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BridgePolicyAnswer {
    pub host: [c_char; BRIDGE_MAX_PROXY_HOST],
    pub port: u16,
    pub no_cache: bool,
}

impl Default for BridgePolicyAnswer {
    fn default() -> Self {
        Self {
            host: [0; BRIDGE_MAX_PROXY_HOST],
            port: 0,
            no_cache: false,
        }
    }
}

impl BridgePolicyAnswer {
    fn host(&self) -> Option<String> {
        let bytes: Vec<u8> = self
            .host
            .iter()
            .take_while(|&&byte| byte != 0)
            .map(|&byte| byte as u8)
            .collect();
        if bytes.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Policy engine supplied by the host application.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BridgePolicyCallbacks {
    pub evaluate: Option<PolicyEvaluateFn>,
    pub context: *mut c_void,
}

unsafe impl Send for BridgePolicyCallbacks {}
unsafe impl Sync for BridgePolicyCallbacks {}

pub struct CallbackPolicy {
    callbacks: BridgePolicyCallbacks,
}

impl CallbackPolicy {
    pub fn new(callbacks: BridgePolicyCallbacks) -> Self {
        Self { callbacks }
    }
}

impl PolicyEngine for CallbackPolicy {
    fn evaluate(
        &self,
        application: &str,
        name: &str,
        port: u16,
    ) -> Result<PolicyAnswer, PolicyError> {
        let Some(evaluate) = self.callbacks.evaluate else {
            return Err(PolicyError::Missing);
        };
        let application = CString::new(application)
            .map_err(|_| PolicyError::Failed("application contains NUL".into()))?;
        let name =
            CString::new(name).map_err(|_| PolicyError::Failed("name contains NUL".into()))?;
        let mut answer = BridgePolicyAnswer::default();
        let ok = unsafe {
            evaluate(
                application.as_ptr(),
                name.as_ptr(),
                port,
                &mut answer,
                self.callbacks.context,
            )
        };
        if !ok {
            return Err(PolicyError::Failed("callback reported failure".into()));
        }
        Ok(PolicyAnswer {
            host: answer.host(),
            port: answer.port,
            no_cache: answer.no_cache,
        })
    }
}

/// Forward lookup supplied by the host application for direct dials. It must
/// reach the real resolver, not the hooked one.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BridgeResolverCallbacks {
    pub resolve: Option<ResolveFn>,
    pub context: *mut c_void,
}

unsafe impl Send for BridgeResolverCallbacks {}
unsafe impl Sync for BridgeResolverCallbacks {}

pub struct CallbackResolver {
    callbacks: BridgeResolverCallbacks,
}

impl CallbackResolver {
    pub fn new(callbacks: BridgeResolverCallbacks) -> Self {
        Self { callbacks }
    }
}

impl Resolver for CallbackResolver {
    fn resolve(&self, host: &str, port: u16) -> Result<Candidates, ResolveError> {
        let Some(resolve) = self.callbacks.resolve else {
            return Err(ResolveError::LookupFailed("resolve callback missing".into()));
        };
        let host = CString::new(host).map_err(|_| ResolveError::Unsupported)?;
        // Safety: all-zero is a valid `sockaddr_storage`.
        let mut slots: [libc::sockaddr_storage; BRIDGE_MAX_RESOLVED] =
            unsafe { std::mem::zeroed() };
        let written = unsafe {
            resolve(
                host.as_ptr(),
                port,
                slots.as_mut_ptr(),
                slots.len(),
                self.callbacks.context,
            )
        };
        let Ok(written) = usize::try_from(written) else {
            return Err(ResolveError::LookupFailed("resolve callback reported failure".into()));
        };
        let mut candidates = Candidates::new();
        for slot in &slots[..written.min(BRIDGE_MAX_RESOLVED)] {
            let raw = slot as *const libc::sockaddr_storage as *const libc::sockaddr;
            let len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            // Unknown families are skipped rather than failing the lookup.
            if let Ok(mut address) = unsafe { socket_addr_from_raw(raw, len) } {
                address.set_port(port);
                candidates.push(address);
            }
        }
        if candidates.is_empty() {
            return Err(ResolveError::LookupFailed("no addresses".into()));
        }
        Ok(candidates)
    }
}

#[repr(C)]
pub struct BridgeLogSink {
    pub log: Option<
        unsafe extern "C" fn(
            level: *const c_char,
            message: *const c_char,
            breadcrumbs: u32,
            context: *mut c_void,
        ),
    >,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RouteCounters {
    pub bypassed: u64,
    pub direct: u64,
    pub proxied: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Policy calls that failed or answered with an unusable proxy.
    pub policy_failures: u64,
}

/// Borrows a C string; `None` for null or non-UTF-8 input.
///
/// # Safety
/// `value` must be null or a valid NUL-terminated string that outlives `'a`.
pub unsafe fn c_str<'a>(value: *const c_char) -> Option<&'a str> {
    if value.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(value) }.to_str().ok()
}

/// Copies `value` into a caller buffer with NUL termination. Returns false
/// (leaving a truncated, terminated copy) when it does not fit.
pub fn copy_c_string(value: &str, out: &mut [c_char]) -> bool {
    let Some(capacity) = out.len().checked_sub(1) else {
        return false;
    };
    let bytes = value.as_bytes();
    let len = bytes.len().min(capacity);
    for (slot, byte) in out.iter_mut().zip(&bytes[..len]) {
        *slot = *byte as c_char;
    }
    out[len] = 0;
    bytes.len() <= capacity
}

pub fn set_errno(code: i32) {
    unsafe { *errno_location() = code };
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut i32 {
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
unsafe fn errno_location() -> *mut i32 {
    unsafe { libc::__error() }
}
