// src/web/rate_limiter.rs
//! Per-client request budget for the HTTP API.
//!
//! Each client IP gets `max_requests` per fixed window that opens on its first request.
//! A refused request learns how long until its window closes (sent as `Retry-After`).
//! Entries for quiet clients are dropped by `prune`, which `spawn_cleanup` runs on a timer.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    used: u32,
}

impl Window {
    fn open(now: Instant) -> Self {
        Self { opened: now, used: 0 }
    }

    fn closes_at(&self, length: Duration) -> Instant {
        self.opened + length
    }

    fn is_closed(&self, now: Instant, length: Duration) -> bool {
        now >= self.closes_at(length)
    }
}

#[derive(Clone, Debug)]
pub struct RateLimiter {
    clients: Arc<Mutex<HashMap<IpAddr, Window>>>,
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            max_requests,
            window,
        }
    }

    /// Spends one request of `ip`'s budget. `Err` carries the time until the budget refills.
    pub async fn acquire(&self, ip: IpAddr) -> Result<(), Duration> {
        let now = Instant::now();
        let mut clients = self.clients.lock().await;
        let window = clients.entry(ip).or_insert_with(|| Window::open(now));
        if window.is_closed(now, self.window) {
            *window = Window::open(now);
        }
        if window.used >= self.max_requests {
            return Err(window.closes_at(self.window).saturating_duration_since(now));
        }
        window.used += 1;
        Ok(())
    }

    /// Drops clients whose window has closed. Returns how many were dropped.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|_, window| !window.is_closed(now, self.window));
        before - clients.len()
    }

    /// Number of clients currently holding a window.
    pub async fn tracked(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Runs `prune` every `every` until the handle is aborted.
    pub fn spawn_cleanup(&self, every: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let dropped = limiter.prune().await;
                if dropped > 0 {
                    tracing::debug!("Rate limiter dropped {} idle client(s)", dropped);
                }
            }
        })
    }
}
