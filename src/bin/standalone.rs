use libc::{c_char, c_void};
use socks_bridge::bypass::parse_numeric_host;
use socks_bridge::ffi::BridgeLogSink;
use socks_bridge::policy::rules::{HostMatcher, RuleAction, RulePolicy};
use socks_bridge::{
    BridgeSetBreadcrumbMask, BridgeSetLogSink, NameResolution, ResolveIntent, Route, Router,
    RouterConfig,
};
use std::env;
use std::ffi::{CStr, CString};
use std::net::{SocketAddr, SocketAddrV4, TcpStream, ToSocketAddrs};
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    install_log_sink(settings.verbose);

    let router = Router::new(settings.router_config(), Arc::new(settings.policy()));
    eprintln!(
        "[standalone] routing {}:{} as '{}'",
        settings.host,
        settings.port,
        router.application()
    );

    let target = resolve_target(&router, &settings.host, settings.port)?;
    match router.route(&target) {
        Route::Bypass => println!("route: bypass ({target})"),
        Route::Direct(endpoint) => println!("route: direct ({endpoint})"),
        Route::Proxied { endpoint, proxy } => println!("route: socks5 {proxy} ({endpoint})"),
    }

    let started = Instant::now();
    let stream = match router.dial(&target) {
        Ok(Some(fd)) => TcpStream::from(fd),
        Ok(None) => TcpStream::connect_timeout(&target, settings.timeout)?,
        Err(error) => {
            anyhow::bail!("connect to {}:{} failed: {error}", settings.host, settings.port)
        }
    };
    println!(
        "connected in {:?} (local {}, peer {})",
        started.elapsed(),
        stream.local_addr()?,
        stream.peer_addr()?
    );

    let counters = router.counters();
    println!(
        "counters: bypassed={} direct={} proxied={} failed={} cache_hits={} cache_misses={} policy_failures={}",
        counters.bypassed,
        counters.direct,
        counters.proxied,
        counters.failed,
        counters.cache_hits,
        counters.cache_misses,
        counters.policy_failures
    );
    Ok(())
}

#[derive(Debug)]
struct Settings {
    proxy: Option<SocketAddrV4>,
    via: Vec<String>,
    application: Option<String>,
    timeout: Duration,
    verbose: bool,
    host: String,
    port: u16,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut proxy = None;
        let mut via = Vec::new();
        let mut application = None;
        let mut timeout = Duration::from_secs(10);
        let mut verbose = false;
        let mut positional = Vec::new();
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--proxy" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--proxy requires a value"))?;
                    proxy = Some(
                        value
                            .parse()
                            .map_err(|_| anyhow::anyhow!("invalid proxy address '{value}'"))?,
                    );
                }
                "--via" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--via requires a pattern"))?;
                    via.push(value);
                }
                "--app" => {
                    application = Some(
                        args.next()
                            .ok_or_else(|| anyhow::anyhow!("--app requires a value"))?,
                    );
                }
                "--timeout-ms" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--timeout-ms requires a value"))?;
                    let millis: u64 = value
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid timeout"))?;
                    timeout = Duration::from_millis(millis.max(1));
                }
                "-v" | "--verbose" => verbose = true,
                flag if flag.starts_with('-') => {
                    anyhow::bail!(
                        "unknown argument '{}'. Supported flags: --proxy <ip:port>, --via <pattern>, --app <name>, --timeout-ms <ms>, --verbose",
                        arg
                    );
                }
                _ => positional.push(arg),
            }
        }
        let [host, port] = <[String; 2]>::try_from(positional)
            .map_err(|_| anyhow::anyhow!("usage: standalone [flags] <host> <port>"))?;
        let port = port.parse().map_err(|_| anyhow::anyhow!("invalid port '{port}'"))?;
        if !via.is_empty() && proxy.is_none() {
            anyhow::bail!("--via requires --proxy");
        }
        Ok(Self {
            proxy,
            via,
            application,
            timeout,
            verbose,
            host,
            port,
        })
    }

    fn router_config(&self) -> RouterConfig {
        let defaults = RouterConfig::default();
        RouterConfig {
            dial_timeout: self.timeout,
            application: self.application.clone().unwrap_or(defaults.application.clone()),
            ..defaults
        }
    }

    /// Without `--via` every destination goes through `--proxy`; with it,
    /// only matching hosts do.
    fn policy(&self) -> RulePolicy {
        let Some(proxy) = self.proxy else {
            return RulePolicy::default();
        };
        if self.via.is_empty() {
            return RulePolicy::new(RuleAction::Proxy(proxy));
        }
        let policy = RulePolicy::default();
        for pattern in &self.via {
            policy.install_rule(None, HostMatcher::pattern(pattern), RuleAction::Proxy(proxy));
        }
        policy
    }
}

/// Names go through the synthetic table the same way a hooked lookup would.
fn resolve_target(router: &Router, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    if let Some(ip) = parse_numeric_host(host) {
        return Ok(SocketAddr::new(ip, port));
    }
    let service = port.to_string();
    match router.resolve_name(host, Some(&service), ResolveIntent::Application) {
        NameResolution::Synthetic(address) => Ok(SocketAddr::V4(address)),
        NameResolution::Passthrough => (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("no addresses for {host}")),
    }
}

fn install_log_sink(verbose: bool) {
    unsafe extern "C" fn log_sink(
        level: *const c_char,
        message: *const c_char,
        _breadcrumbs: u32,
        _context: *mut c_void,
    ) {
        if message.is_null() {
            return;
        }
        let entry = unsafe { CStr::from_ptr(message) }.to_string_lossy();
        let level = if level.is_null() {
            "info".into()
        } else {
            unsafe { CStr::from_ptr(level) }.to_string_lossy()
        };
        eprintln!("[bridge][{level}] {entry}");
    }

    let sink = BridgeLogSink {
        log: Some(log_sink),
        context: ptr::null_mut(),
        enabled_breadcrumbs: if verbose { u32::MAX } else { 0 },
    };
    let level = CString::new(if verbose { "debug" } else { "info" }).unwrap_or_default();
    unsafe {
        BridgeSetLogSink(&sink, level.as_ptr(), ptr::null_mut());
    }
    BridgeSetBreadcrumbMask(if verbose { u32::MAX } else { 0 });
}
