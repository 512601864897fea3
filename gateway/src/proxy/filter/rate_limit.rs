use crate::config::RateLimitConfig;
use crate::error::GatewayError;
use crate::proxy::context::RequestContext;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use super::FilterResult;

/// Per-client-IP sliding window limiter for one route.
///
/// Approximates a true sliding window by blending the previous window's
/// count with the current one, weighted by how far into the current window
/// we are:
///   estimated = prev_count × (1 - elapsed_ratio) + current_count
///
/// This avoids the fixed-window edge case where two adjacent windows pass
/// 2× the limit in a short burst around the boundary.
pub struct RateLimiter {
    windows: DashMap<IpAddr, Arc<SlidingWindow>>,
    max_count: u64,
    window_us: u64,
}

struct SlidingWindow {
    inner: Mutex<SlidingWindowInner>,
    /// Last access timestamp in microseconds (for GC). Updated outside the lock.
    last_access: AtomicU64,
}

struct SlidingWindowInner {
    current_count: u64,
    prev_count: u64,
    /// Start of the current window in microseconds.
    window_start: u64,
}

/// Entries idle for this many windows are eligible for eviction.
const GC_IDLE_WINDOWS: u64 = 2;
/// Hard cap on tracked clients per route.
const MAX_ENTRIES: usize = 100_000;

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            max_count: config.max.max(1),
            window_us: config.window_ms.max(1) * 1_000,
        }
    }

    /// `true` if allowed, `false` if rate limited.
    pub async fn check(&self, key: IpAddr) -> bool {
        // Fast path: key already exists.
        let window = if let Some(entry) = self.windows.get(&key) {
            entry.value().clone()
        } else {
            self.windows
                .entry(key)
                .or_insert_with(|| {
                    let now = now_us();
                    Arc::new(SlidingWindow {
                        inner: Mutex::new(SlidingWindowInner {
                            current_count: 0,
                            prev_count: 0,
                            window_start: now,
                        }),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };

        window.last_access.store(now_us(), Ordering::Relaxed);
        window.try_acquire(self.max_count, self.window_us).await
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Drop clients idle for a couple of windows; if still above the cap,
    /// force-evict the oldest.
    pub fn evict_stale(&self) {
        let now = now_us();
        let expire_us = self.window_us.saturating_mul(GC_IDLE_WINDOWS);
        self.windows
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);

        let overflow = self.windows.len().saturating_sub(MAX_ENTRIES);
        if overflow == 0 {
            return;
        }
        let mut entries: Vec<(IpAddr, u64)> = self
            .windows
            .iter()
            .map(|r| {
                let age = now.saturating_sub(r.value().last_access.load(Ordering::Relaxed));
                (*r.key(), age)
            })
            .collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in entries.into_iter().take(overflow) {
            self.windows.remove(&key);
        }
    }
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

impl SlidingWindow {
    async fn try_acquire(&self, max_count: u64, window_us: u64) -> bool {
        let now = now_us();
        let mut w = self.inner.lock().await;

        // Advance; more than once after a long pause.
        while now.saturating_sub(w.window_start) >= window_us {
            w.prev_count = w.current_count;
            w.current_count = 0;
            w.window_start += window_us;
        }

        let elapsed_in_window = now.saturating_sub(w.window_start);
        let weight = 1.0 - (elapsed_in_window as f64 / window_us as f64);
        let estimated = (w.prev_count as f64 * weight) as u64 + w.current_count;

        if estimated < max_count {
            w.current_count += 1;
            true
        } else {
            false
        }
    }
}

pub(super) async fn rate_limit_on_request(
    limiter: &RateLimiter,
    ctx: &mut RequestContext,
) -> FilterResult {
    if !limiter.check(ctx.client_ip).await {
        tracing::debug!(
            "filter: rate_limit: rejected, route={}, client={}",
            ctx.route_pattern(),
            ctx.client_ip
        );
        metrics::counter!(
            "gateway_rate_limit_rejected_total",
            "route" => ctx.route_pattern().to_string(),
        )
        .increment(1);
        return FilterResult::Reject(GatewayError::RateLimited);
    }
    FilterResult::Continue
}
