#![deny(unsafe_op_in_unsafe_fn)]

pub mod bypass;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod establish;
pub mod ffi;
pub mod logger;
pub mod policy;
pub mod resolve_table;
pub mod router;
mod stats;

pub use crate::endpoint::Endpoint;
pub use crate::error::RouteError;
pub use crate::policy::{PolicyAnswer, PolicyEngine, PolicyError, ProxyDecision};
pub use crate::router::{ConnectVerdict, NameResolution, ResolveIntent, Route, Router, RouterConfig};

use crate::dns::{Resolver, SystemResolver};
use crate::endpoint::socket_addr_from_raw;
use crate::ffi::{
    BridgeConfig, BridgeLogSink, BridgePolicyCallbacks, BridgeResolverCallbacks, CallbackPolicy,
    CallbackResolver, RouteCounters, BRIDGE_CONNECT_PASSTHROUGH,
};
use crate::logger::BreadcrumbFlags;
use std::ffi::CStr;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::raw::c_char;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

pub const BRIDGE_RESOLVE_APPLICATION: u32 = 0;
pub const BRIDGE_RESOLVE_NUMERIC_HOST: u32 = 1;
pub const BRIDGE_RESOLVE_POLICY: u32 = 2;

pub const BRIDGE_ROUTE_INVALID: i32 = -1;
pub const BRIDGE_ROUTE_BYPASS: i32 = 0;
pub const BRIDGE_ROUTE_DIRECT: i32 = 1;
pub const BRIDGE_ROUTE_PROXY: i32 = 2;

pub const BRIDGE_NAME_OK: i32 = 0;
pub const BRIDGE_NAME_PASSTHROUGH: i32 = 1;
pub const BRIDGE_NAME_OVERFLOW: i32 = -1;

/// Opaque router handle shared with the interception layer.
pub struct BridgeRouter {
    router: Router,
}

/// Creates a router. `resolver` may be null, in which case direct dials to
/// named targets use the platform resolver; hooked processes should pass a
/// callback that reaches the unhooked lookup.
#[no_mangle]
pub unsafe extern "C" fn BridgeNewRouter(
    config: *const BridgeConfig,
    policy: *const BridgePolicyCallbacks,
    resolver: *const BridgeResolverCallbacks,
) -> *mut BridgeRouter {
    let Some(policy) = (unsafe { policy.as_ref() }) else {
        crate::logger::error("BridgeNewRouter: policy callbacks missing");
        return std::ptr::null_mut();
    };
    if policy.evaluate.is_none() {
        crate::logger::error("BridgeNewRouter: policy evaluate callback missing");
        return std::ptr::null_mut();
    }
    let config = if let Some(cfg) = NonNull::new(config as *mut BridgeConfig) {
        unsafe { *cfg.as_ptr() }
    } else {
        BridgeConfig::default()
    };
    let resolver: Arc<dyn Resolver> = match unsafe { resolver.as_ref() } {
        Some(callbacks) if callbacks.resolve.is_some() => {
            Arc::new(CallbackResolver::new(*callbacks))
        }
        _ => Arc::new(SystemResolver::default()),
    };
    let router = Router::with_resolver(
        unsafe { config.to_router_config() },
        Arc::new(CallbackPolicy::new(*policy)),
        resolver,
    );
    Box::into_raw(Box::new(BridgeRouter { router }))
}

#[no_mangle]
pub unsafe extern "C" fn BridgeFreeRouter(router: *mut BridgeRouter) {
    if let Some(router) = NonNull::new(router) {
        unsafe {
            drop(Box::from_raw(router.as_ptr()));
        }
    }
}

/// Replacement for `connect(2)`.
///
/// Returns `BRIDGE_CONNECT_PASSTHROUGH` when the caller should run the
/// original primitive, `0` once `fd` holds the routed connection, or `-1`
/// with `errno` set: `EINPROGRESS` for a non-blocking descriptor that is
/// already connected, `ETIMEDOUT` for every routing failure.
#[no_mangle]
pub unsafe extern "C" fn BridgeRouterConnect(
    router: *mut BridgeRouter,
    fd: i32,
    address: *const libc::sockaddr,
    address_len: libc::socklen_t,
) -> i32 {
    let Some(router) = NonNull::new(router) else {
        return BRIDGE_CONNECT_PASSTHROUGH;
    };
    let target = match unsafe { socket_addr_from_raw(address, address_len) } {
        Ok(target) => target,
        Err(error) => {
            crate::logger::breadcrumb(
                BreadcrumbFlags::FFI,
                format!("connect on fd {fd} passed through: {error}"),
            );
            return BRIDGE_CONNECT_PASSTHROUGH;
        }
    };
    match unsafe { router.as_ref() }.router.connect(fd, &target) {
        ConnectVerdict::Passthrough => BRIDGE_CONNECT_PASSTHROUGH,
        ConnectVerdict::Connected => 0,
        ConnectVerdict::InProgress => {
            ffi::set_errno(libc::EINPROGRESS);
            -1
        }
        ConnectVerdict::Failed(error) => {
            crate::logger::breadcrumb(
                BreadcrumbFlags::FFI,
                format!("connect on fd {fd} to {target} failed: {error}"),
            );
            ffi::set_errno(libc::ETIMEDOUT);
            -1
        }
    }
}

/// Replacement for forward resolution. Returns true and fills `out` with a
/// synthetic IPv4 socket address; false means the caller resolves normally.
#[no_mangle]
pub unsafe extern "C" fn BridgeRouterResolveName(
    router: *mut BridgeRouter,
    name: *const c_char,
    service: *const c_char,
    intent: u32,
    out: *mut libc::sockaddr_in,
) -> bool {
    let Some(router) = NonNull::new(router) else {
        return false;
    };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return false;
    };
    let Some(name) = (unsafe { ffi::c_str(name) }) else {
        return false;
    };
    let service = unsafe { ffi::c_str(service) };
    let intent = match intent {
        BRIDGE_RESOLVE_APPLICATION => ResolveIntent::Application,
        BRIDGE_RESOLVE_NUMERIC_HOST => ResolveIntent::NumericHost,
        _ => ResolveIntent::Policy,
    };
    match unsafe { router.as_ref() }
        .router
        .resolve_name(name, service, intent)
    {
        NameResolution::Passthrough => false,
        NameResolution::Synthetic(address) => {
            *out = sockaddr_in_from(address);
            true
        }
    }
}

/// Route decision for a hostname endpoint, for interception points that see
/// names rather than socket addresses. `port` is in host byte order.
///
/// Returns `BRIDGE_ROUTE_PROXY` with the SOCKS5 proxy written to
/// `out_proxy`, `BRIDGE_ROUTE_DIRECT`, `BRIDGE_ROUTE_BYPASS`, or
/// `BRIDGE_ROUTE_INVALID` for a null router or unreadable name.
#[no_mangle]
pub unsafe extern "C" fn BridgeRouterRouteName(
    router: *mut BridgeRouter,
    name: *const c_char,
    port: u16,
    out_proxy: *mut libc::sockaddr_in,
) -> i32 {
    let Some(router) = NonNull::new(router) else {
        return BRIDGE_ROUTE_INVALID;
    };
    let Some(name) = (unsafe { ffi::c_str(name) }) else {
        return BRIDGE_ROUTE_INVALID;
    };
    match unsafe { router.as_ref() }.router.route_name(name, port) {
        Route::Bypass => BRIDGE_ROUTE_BYPASS,
        Route::Direct(_) => BRIDGE_ROUTE_DIRECT,
        Route::Proxied { proxy, .. } => {
            if let Some(out) = unsafe { out_proxy.as_mut() } {
                *out = sockaddr_in_from(proxy);
            }
            BRIDGE_ROUTE_PROXY
        }
    }
}

/// Replacement for reverse resolution of `s_addr` (network byte order).
///
/// Returns `BRIDGE_NAME_OK` with the bound name in `out`,
/// `BRIDGE_NAME_PASSTHROUGH` when the address is not a live synthetic one, or
/// `BRIDGE_NAME_OVERFLOW` when `out` is too small.
#[no_mangle]
pub unsafe extern "C" fn BridgeRouterReverseName(
    router: *mut BridgeRouter,
    s_addr: u32,
    out: *mut c_char,
    out_len: usize,
) -> i32 {
    let Some(router) = NonNull::new(router) else {
        return BRIDGE_NAME_PASSTHROUGH;
    };
    let address = Ipv4Addr::from(u32::from_be(s_addr));
    let Some(name) = unsafe { router.as_ref() }.router.reverse_name(address) else {
        return BRIDGE_NAME_PASSTHROUGH;
    };
    if out.is_null() || out_len == 0 {
        return BRIDGE_NAME_OVERFLOW;
    }
    // Safety: caller guarantees `out` points to `out_len` writable bytes.
    let buffer = unsafe { slice::from_raw_parts_mut(out, out_len) };
    if ffi::copy_c_string(&name, buffer) {
        BRIDGE_NAME_OK
    } else {
        BRIDGE_NAME_OVERFLOW
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeRouterIsSynthetic(router: *mut BridgeRouter, s_addr: u32) -> bool {
    let Some(router) = NonNull::new(router) else {
        return false;
    };
    unsafe { router.as_ref() }
        .router
        .is_synthetic(Ipv4Addr::from(u32::from_be(s_addr)))
}

#[no_mangle]
pub unsafe extern "C" fn BridgeRouterGetCounters(
    router: *mut BridgeRouter,
    out: *mut RouteCounters,
) -> bool {
    let Some(router) = NonNull::new(router) else {
        return false;
    };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return false;
    };
    *out = unsafe { router.as_ref() }.router.counters();
    true
}

#[no_mangle]
pub unsafe extern "C" fn BridgeSetLogSink(
    sink: *const BridgeLogSink,
    level: *const c_char,
    _error: *mut *mut std::ffi::c_void,
) -> bool {
    let sink_ref = unsafe { sink.as_ref() };
    let level_str = if level.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(level) }.to_str().ok()
    };
    crate::logger::install_sink(sink_ref, level_str).is_ok()
}

#[no_mangle]
pub extern "C" fn BridgeSetBreadcrumbMask(mask: u32) {
    crate::logger::set_breadcrumb_mask(mask);
}

#[no_mangle]
pub extern "C" fn BridgeEnsureLinked() -> bool {
    true
}

fn sockaddr_in_from(address: SocketAddrV4) -> libc::sockaddr_in {
    // Safety: all-zero is a valid `sockaddr_in`.
    let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        raw.sin_len = std::mem::size_of::<libc::sockaddr_in>() as u8;
    }
    raw.sin_family = libc::AF_INET as libc::sa_family_t;
    raw.sin_port = address.port().to_be();
    raw.sin_addr = libc::in_addr {
        s_addr: u32::from(*address.ip()).to_be(),
    };
    raw
}
