//! Per-client rate limiting middleware.
//!
//! Token bucket keyed by client IP. `/health` is exempt.
//!
//! X-Forwarded-For and X-Real-IP are only believed when the TCP peer is one
//! of the configured trusted proxies; otherwise a client could pick its own
//! bucket.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

use crate::config::RateLimitConfig;

pub type KeyedRateLimiter = DefaultKeyedRateLimiter<IpAddr>;

const DEFAULT_RPS: NonZeroU32 = match NonZeroU32::new(100) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};
const DEFAULT_BURST: NonZeroU32 = match NonZeroU32::new(50) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};

#[derive(Clone)]
pub struct RateLimitState {
    limiter: Option<Arc<KeyedRateLimiter>>,
    trusted_proxies: Arc<HashSet<IpAddr>>,
}

impl RateLimitState {
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self {
                limiter: None,
                trusted_proxies: Arc::default(),
            };
        }

        // Zero in either field falls back to the defaults.
        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(DEFAULT_RPS);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(DEFAULT_BURST);
        let quota = Quota::per_second(rps).allow_burst(burst);

        let trusted_proxies: HashSet<IpAddr> = config
            .trusted_proxies
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    tracing::warn!(proxy = %s, "ignoring unparseable trusted proxy");
                    None
                }
            })
            .collect();

        if !trusted_proxies.is_empty() {
            tracing::info!(
                count = trusted_proxies.len(),
                "Configured trusted proxies for rate limiting"
            );
        }

        Self {
            limiter: Some(Arc::new(RateLimiter::keyed(quota))),
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    pub fn should_trust_headers(&self, connection_ip: Option<IpAddr>) -> bool {
        connection_ip.is_some_and(|ip| self.trusted_proxies.contains(&ip))
    }

    /// True when `ip` may make another request now.
    pub fn check(&self, ip: IpAddr) -> bool {
        match self.limiter {
            Some(ref limiter) => limiter.check_key(&ip).is_ok(),
            None => true,
        }
    }
}

/// Returns 429 with `Retry-After` once a client exhausts its bucket.
pub async fn rate_limit_middleware(
    State(rate_limit): State<RateLimitState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !rate_limit.is_enabled() || req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let client_ip = extract_client_ip(&req, &rate_limit);
    if rate_limit.check(client_ip) {
        return next.run(req).await;
    }

    tracing::debug!(client_ip = %client_ip, "Rate limit exceeded");
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", "1")],
        "Rate limit exceeded. Please slow down.",
    )
        .into_response()
}

fn extract_client_ip(req: &Request<Body>, rate_limit: &RateLimitState) -> IpAddr {
    let connection_ip: Option<IpAddr> = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if rate_limit.should_trust_headers(connection_ip) {
        if let Some(forwarded) = req
            .headers()
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
        {
            // First entry is the original client.
            if let Some(ip) = forwarded
                .split(',')
                .next()
                .and_then(|s| s.trim().parse().ok())
            {
                return ip;
            }
        }

        if let Some(ip) = req
            .headers()
            .get("X-Real-IP")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok())
        {
            return ip;
        }
    }

    connection_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
