//! Fixed-window rate governor.
//!
//! Each request is routed to a named limiter (`auth`, `api`, `submission`,
//! `upload`, ...) by the configured route rules, then counted against the
//! caller's window in that limiter. A window opens on the first request and
//! lasts `window_ms`; the `max + 1`-th request inside it is denied with
//! `429 Too Many Requests` and a `Retry-After` header.
//!
//! # Memory Safety
//!
//! - Each limiter tracks at most `max_entries` identifiers; new identifiers
//!   past that are rejected with `rate_limiter_at_capacity`
//! - A background sweep removes windows that have elapsed
//!
//! # Security Note
//!
//! By default, X-Forwarded-For and X-Real-IP headers are NOT trusted to prevent
//! IP spoofing attacks. You must explicitly configure `trusted_proxies` to enable
//! header-based IP detection:
//!
//! - Empty list (default): Only direct connection IP is used (most secure)
//! - List of IPs/CIDRs: Headers trusted only when request comes from these IPs
//! - ["*"]: Trust headers from all sources (NOT recommended for production)

use crate::metrics;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::{DashMap, mapref::entry::Entry};
use ipnet::IpNet;
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use stowage_core::config::{DEFAULT_LIMITER, LimiterConfig, RateLimitConfig, RouteRule};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Retry hint returned when the table is full.
const AT_CAPACITY_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Rate limiter state shared across requests.
#[derive(Clone)]
pub struct RateLimitState {
    inner: Option<Arc<RateLimitStateInner>>,
}

/// Inner state that's only allocated when rate limiting is enabled.
struct RateLimitStateInner {
    limiters: HashMap<String, Limiter>,
    rules: Vec<RouteRule>,
    trusted_proxies: TrustedProxies,
    /// Maximum identifiers per limiter before rejecting new ones.
    max_entries: u32,
    /// Whether ConnectInfo missing warning has been logged.
    connect_info_warned: AtomicBool,
}

/// Counter for one identifier inside one limiter.
#[derive(Clone, Copy, Debug)]
struct RateWindow {
    count: u32,
    window_start: Instant,
}

struct Limiter {
    config: LimiterConfig,
    windows: DashMap<String, RateWindow>,
    /// Whether the at-capacity warning has been logged for the current capacity event.
    at_capacity_warned: AtomicBool,
}

impl Limiter {
    fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            at_capacity_warned: AtomicBool::new(false),
        }
    }
}

/// Outcome of a single rate check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Time until the current window closes. Zero when allowed.
    pub retry_after: Duration,
    pub reason: Option<RateLimitReason>,
}

impl Decision {
    fn allow(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: Duration::ZERO,
            reason: None,
        }
    }

    fn deny(retry_after: Duration, reason: RateLimitReason) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after,
            reason: Some(reason),
        }
    }

    /// Convert a denial into the error returned to the client.
    pub fn into_result(self) -> Result<Decision, RateLimitError> {
        match self.reason {
            Some(reason) if !self.allowed => Err(RateLimitError {
                retry_after_secs: retry_after_secs(self.retry_after),
                reason,
            }),
            _ => Ok(self),
        }
    }
}

/// Whole seconds until retry, rounded up and never zero.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

/// A parsed trusted proxy entry (either an IP or CIDR range).
#[derive(Clone, Debug)]
enum TrustedEntry {
    Ip(IpAddr),
    Cidr(IpNet),
}

/// Trusted proxy configuration for IP extraction.
#[derive(Clone, Debug)]
enum TrustedProxies {
    /// Never trust forwarded headers (default, most secure).
    None,
    /// Trust headers from all sources (dangerous, for development only).
    All,
    /// Trust headers only from specific IPs/CIDRs.
    List(Vec<TrustedEntry>),
}

impl TrustedProxies {
    fn from_config(proxies: &[String]) -> Self {
        if proxies.is_empty() {
            return Self::None;
        }
        if proxies.len() == 1 && proxies[0] == "*" {
            return Self::All;
        }
        let entries = proxies
            .iter()
            .filter_map(|p| {
                if p.contains('/') {
                    p.parse::<IpNet>()
                        .inspect_err(|e| {
                            tracing::warn!("Invalid CIDR in trusted_proxies: '{}': {}", p, e)
                        })
                        .ok()
                        .map(TrustedEntry::Cidr)
                } else {
                    p.parse::<IpAddr>()
                        .inspect_err(|e| {
                            tracing::warn!("Invalid IP in trusted_proxies: '{}': {}", p, e)
                        })
                        .ok()
                        .map(TrustedEntry::Ip)
                }
            })
            .collect();
        Self::List(entries)
    }

    /// Check if the given connection IP is a trusted proxy.
    fn is_trusted(&self, connection_ip: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::List(entries) => {
                let Ok(ip) = connection_ip.parse::<IpAddr>() else {
                    return false;
                };
                entries.iter().any(|entry| match entry {
                    TrustedEntry::Ip(trusted) => *trusted == ip,
                    TrustedEntry::Cidr(network) => network.contains(&ip),
                })
            }
        }
    }
}

impl RateLimitState {
    /// Create a new rate limit state from configuration.
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self { inner: None };
        }

        let limiters = config
            .limiters
            .iter()
            .map(|(name, limiter)| (name.clone(), Limiter::new(*limiter)))
            .collect();

        Self {
            inner: Some(Arc::new(RateLimitStateInner {
                limiters,
                rules: config.rules.clone(),
                trusted_proxies: TrustedProxies::from_config(&config.trusted_proxies),
                max_entries: config.max_entries,
                connect_info_warned: AtomicBool::new(false),
            })),
        }
    }

    /// A state that admits everything.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Check if rate limiting is enabled.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Name of the limiter governing `method path`.
    pub fn limiter_for<'a>(&'a self, method: &str, path: &str) -> &'a str {
        let Some(inner) = &self.inner else {
            return DEFAULT_LIMITER;
        };
        inner
            .rules
            .iter()
            .find(|rule| rule.matches(method, path))
            .map(|rule| rule.limiter.as_str())
            .unwrap_or(DEFAULT_LIMITER)
    }

    /// Count one request from `identifier` against `limiter`.
    pub fn check(&self, limiter: &str, identifier: &str) -> Decision {
        self.check_at(limiter, identifier, Instant::now())
    }

    /// [`check`](Self::check) at an explicit instant.
    pub fn check_at(&self, limiter: &str, identifier: &str, now: Instant) -> Decision {
        let Some(inner) = &self.inner else {
            return Decision::allow(u32::MAX);
        };
        let Some(limiter_state) = inner
            .limiters
            .get(limiter)
            .or_else(|| inner.limiters.get(DEFAULT_LIMITER))
        else {
            return Decision::allow(u32::MAX);
        };

        let window = limiter_state.config.window();
        let max = limiter_state.config.max;

        // DashMap's len() can deadlock if called while holding an entry lock,
        // so capacity is read first. The race can overshoot max_entries by at
        // most the number of concurrent inserters.
        let current_len = limiter_state.windows.len();
        let at_capacity = current_len >= inner.max_entries as usize;

        match limiter_state.windows.entry(identifier.to_string()) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                let elapsed = now.saturating_duration_since(state.window_start);
                if elapsed > window {
                    *state = RateWindow {
                        count: 1,
                        window_start: now,
                    };
                    Decision::allow(max.saturating_sub(1))
                } else if state.count < max {
                    state.count += 1;
                    Decision::allow(max - state.count)
                } else {
                    Decision::deny(window - elapsed, RateLimitReason::RateLimited)
                }
            }
            Entry::Vacant(entry) => {
                if at_capacity {
                    Self::warn_at_capacity(
                        &limiter_state.at_capacity_warned,
                        limiter,
                        current_len,
                        inner.max_entries,
                    );
                    return Decision::deny(AT_CAPACITY_RETRY_AFTER, RateLimitReason::AtCapacity);
                }
                entry.insert(RateWindow {
                    count: 1,
                    window_start: now,
                });
                Decision::allow(max.saturating_sub(1))
            }
        }
    }

    /// Remove windows whose limiter window has elapsed.
    /// Returns the number of entries evicted.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) at an explicit instant.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };

        let mut total_evicted = 0;
        for (name, limiter) in &inner.limiters {
            let window = limiter.config.window();
            let before = limiter.windows.len();
            // retain holds each shard lock while it runs, so a window touched
            // concurrently is either kept or already reset by the caller.
            limiter
                .windows
                .retain(|_, w| now.saturating_duration_since(w.window_start) <= window);
            let evicted = before.saturating_sub(limiter.windows.len());
            if evicted > 0 {
                limiter.at_capacity_warned.store(false, Ordering::Relaxed);
                tracing::debug!(
                    limiter = %name,
                    evicted,
                    remaining = limiter.windows.len(),
                    "Swept expired rate windows"
                );
            }
            total_evicted += evicted;
        }
        total_evicted
    }

    /// Tracked identifiers in `limiter`.
    pub fn entry_count(&self, limiter: &str) -> usize {
        self.inner
            .as_ref()
            .and_then(|inner| inner.limiters.get(limiter))
            .map(|l| l.windows.len())
            .unwrap_or(0)
    }

    /// Log a warning if ConnectInfo is not available (only once).
    fn warn_connect_info_missing(&self) {
        if let Some(inner) = &self.inner
            && !inner.connect_info_warned.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                "ConnectInfo not available for rate limiting. All requests will share a single \
                     rate limit bucket ('unknown' IP). Add .into_make_service_with_connect_info::<SocketAddr>() \
                     to your server configuration to enable per-IP rate limiting."
            );
        }
    }

    /// Log a warning when a limiter is at capacity, once per capacity event.
    fn warn_at_capacity(
        warned_flag: &AtomicBool,
        limiter: &str,
        current_entries: usize,
        max_entries: u32,
    ) {
        if !warned_flag.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                current_entries = current_entries,
                max_entries = max_entries,
                limiter = limiter,
                "Rate limiter at capacity, rejecting new entries. \
                 This warning is logged once per capacity event to prevent log spam."
            );
        }
    }
}

/// Reason for rate limit rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    /// Request exceeded rate limit.
    RateLimited,
    /// Rate limiter at capacity, cannot track new entries.
    AtCapacity,
}

/// Error returned when rate limit is exceeded.
#[derive(Debug)]
pub struct RateLimitError {
    /// Number of seconds to wait before retrying.
    pub retry_after_secs: u64,
    /// Reason for the rate limit.
    pub reason: RateLimitReason,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let (code, message) = match self.reason {
            RateLimitReason::RateLimited => (
                "rate_limit_exceeded",
                format!(
                    "Rate limit exceeded. Retry after {} seconds.",
                    self.retry_after_secs
                ),
            ),
            RateLimitReason::AtCapacity => (
                "rate_limiter_at_capacity",
                "Server is experiencing high load. Please retry later.".to_string(),
            ),
        };

        let body = serde_json::json!({
            "code": code,
            "message": message,
            "retry_after": self.retry_after_secs,
        });

        (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", self.retry_after_secs.to_string())],
            axum::Json(body),
        )
            .into_response()
    }
}

/// Extract client IP address from request headers (only if trusted).
fn extract_forwarded_ip(req: &Request<Body>) -> Option<String> {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(s) = forwarded.to_str()
        && let Some(ip) = s.split(',').next()
    {
        return Some(ip.trim().to_string());
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(s) = real_ip.to_str()
    {
        return Some(s.trim().to_string());
    }

    None
}

/// Extract connection IP from request extensions (set by ConnectInfo).
fn extract_connection_ip(req: &Request<Body>) -> Option<String> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
}

/// Extract client IP address from request.
///
/// Forwarded headers are only read when the connection comes from a trusted
/// proxy (or every source is trusted with `*`).
fn extract_ip(req: &Request<Body>, state: &RateLimitState) -> String {
    let Some(inner) = &state.inner else {
        return "unknown".to_string();
    };

    let connection_ip = extract_connection_ip(req);

    let trust_headers = match (&connection_ip, &inner.trusted_proxies) {
        (None, TrustedProxies::All) => true,
        // Can't verify the proxy without a connection IP.
        (None, _) => false,
        (Some(conn_ip), trusted_proxies) => trusted_proxies.is_trusted(conn_ip),
    };

    if trust_headers && let Some(forwarded_ip) = extract_forwarded_ip(req) {
        return forwarded_ip;
    }

    match connection_ip {
        Some(ip) => ip,
        None => {
            state.warn_connect_info_missing();
            "unknown".to_string()
        }
    }
}

/// Rate limiting middleware applied in front of every route.
pub async fn rate_limit_middleware(
    State(rate_limit): State<RateLimitState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !rate_limit.is_enabled() {
        return next.run(req).await;
    }

    let ip = extract_ip(&req, &rate_limit);
    let limiter = rate_limit
        .limiter_for(req.method().as_str(), req.uri().path())
        .to_string();

    match rate_limit.check(&limiter, &ip).into_result() {
        Ok(_) => next.run(req).await,
        Err(e) => {
            metrics::record_rate_limit_denial(&limiter);
            tracing::debug!(limiter = %limiter, client = %ip, reason = ?e.reason, "request denied");
            e.into_response()
        }
    }
}

/// Spawn a background task that periodically sweeps elapsed windows until
/// `shutdown` is cancelled.
pub fn spawn_sweeper(
    state: RateLimitState,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Rate limiter sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let evicted = state.sweep();
                    if evicted > 0 {
                        tracing::info!(
                            evicted = evicted,
                            "Rate limiter sweeper evicted expired windows"
                        );
                    }
                }
            }
        }
    })
}
