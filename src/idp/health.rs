//! Privileged channel health
//!
//! Tracks consecutive failures of the admin channel. Crossing the threshold
//! marks the channel unhealthy; the owner then drops memoized endpoint and
//! token state. While unhealthy, calls are refused until a cooldown has
//! passed, after which a single trial call is let through.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

fn now_ms() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}

/// Consecutive-failure tracker for the admin channel
#[derive(Debug)]
pub struct ChannelHealth {
    threshold: u64,
    cooldown: Duration,
    healthy: AtomicBool,
    /// Earliest instant the next trial call may go out while unhealthy
    retry_at: Mutex<Option<Instant>>,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    consecutive_failures: AtomicU64,
    trips: AtomicU64,
    last_success: AtomicU64,
    last_failure: AtomicU64,
    last_latency: AtomicU64,
}

impl ChannelHealth {
    /// Tracker that trips after `threshold` consecutive failures (minimum 1)
    /// and refuses calls for `cooldown` after a trip or a failed trial.
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: u64::from(threshold.max(1)),
            cooldown,
            healthy: AtomicBool::new(true),
            retry_at: Mutex::new(None),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            trips: AtomicU64::new(0),
            last_success: AtomicU64::new(0),
            last_failure: AtomicU64::new(0),
            last_latency: AtomicU64::new(0),
        }
    }

    /// Record a call that reached the IdP
    pub fn record_success(&self, latency: Duration) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_success.store(now_ms(), Ordering::Relaxed);
        self.last_latency.store(
            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );

        if !self.healthy.swap(true, Ordering::Relaxed) {
            *self.retry_at.lock() = None;
            info!("Admin channel recovered");
        }
    }

    /// Record a channel failure. Returns `true` when this failure tripped the
    /// channel from healthy to unhealthy.
    pub fn record_failure(&self) -> bool {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_failure.store(now_ms(), Ordering::Relaxed);

        if consecutive < self.threshold {
            return false;
        }
        *self.retry_at.lock() = Some(Instant::now() + self.cooldown);
        if self.healthy.swap(false, Ordering::Relaxed) {
            self.trips.fetch_add(1, Ordering::Relaxed);
            warn!(
                consecutive_failures = consecutive,
                cooldown_ms = u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX),
                "Admin channel marked unhealthy"
            );
            return true;
        }
        false
    }

    /// Whether a call may go out now. Always `true` while healthy; while
    /// unhealthy, `true` once per elapsed cooldown (the trial call).
    pub fn allow_request(&self) -> bool {
        if self.is_healthy() {
            return true;
        }
        let now = Instant::now();
        let mut retry_at = self.retry_at.lock();
        match *retry_at {
            Some(at) if now < at => false,
            _ => {
                // Later callers wait for the trial's outcome or the next cooldown
                *retry_at = Some(now + self.cooldown);
                debug!("Admin channel cooldown elapsed, allowing a trial call");
                true
            }
        }
    }

    /// Whether the channel is currently considered healthy
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Current metrics
    #[must_use]
    pub fn metrics(&self) -> ChannelMetrics {
        ChannelMetrics {
            healthy: self.is_healthy(),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            trips: self.trips.load(Ordering::Relaxed),
            last_success_ms: self.last_success.load(Ordering::Relaxed),
            last_failure_ms: self.last_failure.load(Ordering::Relaxed),
            last_latency_ms: self.last_latency.load(Ordering::Relaxed),
        }
    }
}

/// Channel metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ChannelMetrics {
    /// Current health status
    pub healthy: bool,
    /// Calls that reached the IdP
    pub success_count: u64,
    /// Channel failures
    pub failure_count: u64,
    /// Failures since the last success
    pub consecutive_failures: u64,
    /// Times the channel went unhealthy
    pub trips: u64,
    /// Last success timestamp (millis since epoch)
    pub last_success_ms: u64,
    /// Last failure timestamp (millis since epoch)
    pub last_failure_ms: u64,
    /// Latency of the last successful call (milliseconds)
    pub last_latency_ms: u64,
}
