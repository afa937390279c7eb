//! Per-IP throttle on signaling upgrades.
//!
//! A node that reconnects in a tight loop (bad network, crash loop) should
//! not be able to churn the rendezvous registry. Each client address gets a
//! token bucket; an upgrade costs one token.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::warn;

/// Refill rate and burst size of one client's bucket.
#[derive(Debug, Clone, Copy)]
pub struct Quota {
    pub per_second: f64,
    pub burst: f64,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            per_second: 2.0,
            burst: 10.0,
        }
    }
}

#[derive(Debug)]
struct Allowance {
    tokens: f64,
    touched: Instant,
}

impl Allowance {
    fn full(quota: Quota, now: Instant) -> Self {
        Self {
            tokens: quota.burst,
            touched: now,
        }
    }

    fn take(&mut self, quota: Quota, now: Instant) -> bool {
        let idle = now.saturating_duration_since(self.touched).as_secs_f64();
        self.touched = now;
        self.tokens = (self.tokens + idle * quota.per_second).min(quota.burst);

        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}

#[derive(Clone, Default)]
pub struct UpgradeThrottle {
    clients: Arc<Mutex<HashMap<IpAddr, Allowance>>>,
    quota: Quota,
}

impl UpgradeThrottle {
    pub fn new(quota: Quota) -> Self {
        Self {
            clients: Arc::default(),
            quota,
        }
    }

    pub async fn admit(&self, ip: IpAddr) -> bool {
        self.admit_at(ip, Instant::now()).await
    }

    async fn admit_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut clients = self.clients.lock().await;
        clients
            .entry(ip)
            .or_insert_with(|| Allowance::full(self.quota, now))
            .take(self.quota, now)
    }

    /// Forget clients idle for longer than `max_idle`. Returns how many were dropped.
    pub async fn forget_idle(&self, max_idle: Duration) -> usize {
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        let now = Instant::now();
        clients.retain(|_, a| now.saturating_duration_since(a.touched) < max_idle);
        before - clients.len()
    }
}

pub async fn throttle_upgrades(
    State(throttle): State<UpgradeThrottle>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(ip) = client_ip(&req) {
        if !throttle.admit(ip).await {
            warn!(ip = %ip, "Signaling upgrade throttled");
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }
    Ok(next.run(req).await)
}

/// Forwarding headers win over the socket address so a reverse proxy
/// does not collapse every client into one bucket.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUOTA: Quota = Quota {
        per_second: 1.0,
        burst: 3.0,
    };

    #[tokio::test]
    async fn burst_then_refill() {
        let throttle = UpgradeThrottle::new(QUOTA);
        let ip: IpAddr = "10.1.0.1".parse().unwrap();
        let start = Instant::now();

        for _ in 0..3 {
            assert!(throttle.admit_at(ip, start).await);
        }
        assert!(!throttle.admit_at(ip, start).await);

        // one token back after a second
        let later = start + Duration::from_secs(1);
        assert!(throttle.admit_at(ip, later).await);
        assert!(!throttle.admit_at(ip, later).await);
    }

    #[tokio::test]
    async fn clients_have_separate_buckets() {
        let throttle = UpgradeThrottle::new(Quota {
            per_second: 0.0,
            burst: 1.0,
        });
        let a: IpAddr = "10.1.0.1".parse().unwrap();
        let b: IpAddr = "10.1.0.2".parse().unwrap();

        assert!(throttle.admit(a).await);
        assert!(!throttle.admit(a).await);
        assert!(throttle.admit(b).await);
    }

    #[tokio::test]
    async fn forget_idle_drops_everyone_at_zero() {
        let throttle = UpgradeThrottle::default();
        throttle.admit("192.168.0.9".parse().unwrap()).await;
        assert_eq!(throttle.forget_idle(Duration::ZERO).await, 1);
        assert!(throttle.clients.lock().await.is_empty());
    }

    #[test]
    fn forwarded_header_preferred() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&req), Some("203.0.113.7".parse().unwrap()));

        let req = Request::builder().header("x-real-ip", "198.51.100.2").body(()).unwrap();
        assert_eq!(client_ip(&req), Some("198.51.100.2".parse().unwrap()));

        let req = Request::builder().body(()).unwrap();
        assert_eq!(client_ip(&req), None);
    }
}
