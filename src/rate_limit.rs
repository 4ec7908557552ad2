//! Rolling-window rate limiter for outbound API calls.
//!
//! Throttling upstream is enforced over a sliding interval, not a fixed
//! per-second counter: a client that waits exactly the nominal gap between
//! calls can still be rejected when burst history inside the window is too
//! dense. The limiter therefore keeps the timestamps of recent calls and
//! sleeps until the oldest one falls out of the window.
//!
//! State is per-run and passed explicitly; there is no process-wide limiter.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum calls inside one rolling window.
    pub max_calls: usize,
    /// Window duration.
    pub window: Duration,
    /// Multiplier applied to the effective wait after each external
    /// rejection. Escalation is permanent for the session.
    pub escalation_factor: f64,
    /// Hard call budget for the whole session; exhaustion is not waitable.
    pub session_quota: Option<u64>,
    /// Fraction of the session quota at which to warn (once).
    pub warn_threshold: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // CoinGecko free tier: 30 calls/min, 10k calls/month.
        Self {
            max_calls: 30,
            window: Duration::from_secs(60),
            escalation_factor: 2.0,
            session_quota: Some(10_000),
            warn_threshold: 0.8,
        }
    }
}

#[derive(Debug)]
pub enum RateLimitError {
    /// The session budget is spent; waiting cannot recover this.
    QuotaExhausted { used: u64, limit: u64 },
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExhausted { used, limit } => {
                write!(f, "session quota exhausted: {used}/{limit} calls used")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Cumulative usage counters for observability.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterUsage {
    pub window_calls: usize,
    pub window_limit: usize,
    pub total_calls: u64,
    pub session_quota: Option<u64>,
    pub quota_used_pct: Option<f64>,
    pub rejections: u64,
    pub pacing_multiplier: f64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    calls: VecDeque<Instant>,
    pacing: f64,
    total_calls: u64,
    rejections: u64,
    quota_warned: bool,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            calls: VecDeque::new(),
            pacing: 1.0,
            total_calls: 0,
            rejections: 0,
            quota_warned: false,
        }
    }

    /// Wait until a call is permitted, then record it.
    ///
    /// Errors only when the session quota is exhausted; window pressure is
    /// absorbed by sleeping.
    pub async fn acquire(&mut self) -> Result<(), RateLimitError> {
        if let Some(limit) = self.config.session_quota {
            if self.total_calls >= limit {
                return Err(RateLimitError::QuotaExhausted {
                    used: self.total_calls,
                    limit,
                });
            }
        }

        loop {
            let now = Instant::now();
            self.prune(now);
            if self.calls.len() < self.config.max_calls {
                break;
            }
            let Some(oldest) = self.calls.front().copied() else {
                break;
            };
            let base = (oldest + self.config.window).duration_since(now);
            // 100ms buffer keeps us off the exact window edge.
            let wait = base.mul_f64(self.pacing) + Duration::from_millis(100);
            debug!(
                wait_ms = wait.as_millis() as u64,
                window_calls = self.calls.len(),
                "rate window full, pacing"
            );
            tokio::time::sleep(wait).await;
        }

        self.calls.push_back(Instant::now());
        self.total_calls += 1;
        self.maybe_warn_quota();
        Ok(())
    }

    /// Record an external rejection that happened despite local pacing.
    /// Effective delays escalate for the remainder of the session.
    pub fn record_rejection(&mut self) {
        self.rejections += 1;
        self.pacing *= self.config.escalation_factor;
        warn!(
            rejections = self.rejections,
            pacing = self.pacing,
            "rejected upstream despite pacing, escalating"
        );
    }

    pub fn usage(&self) -> RateLimiterUsage {
        let quota_used_pct = self
            .config
            .session_quota
            .map(|q| (self.total_calls as f64 / q as f64) * 100.0);
        RateLimiterUsage {
            window_calls: self.calls.len(),
            window_limit: self.config.max_calls,
            total_calls: self.total_calls,
            session_quota: self.config.session_quota,
            quota_used_pct,
            rejections: self.rejections,
            pacing_multiplier: self.pacing,
        }
    }

    /// Split the remaining budget across `workers` independent limiters.
    ///
    /// Each worker gets its own window share and quota slice up front, so
    /// parallel fetchers cannot jointly exceed the rolling window. Consumes
    /// the parent limiter: budgets are never shared implicitly.
    pub fn partition(self, workers: usize) -> Vec<RateLimiter> {
        let workers = workers.max(1);
        let per_window = (self.config.max_calls / workers).max(1);
        let per_quota = self.config.session_quota.map(|q| {
            let remaining = q.saturating_sub(self.total_calls);
            remaining / workers as u64
        });
        (0..workers)
            .map(|_| {
                RateLimiter::new(RateLimitConfig {
                    max_calls: per_window,
                    session_quota: per_quota,
                    ..self.config.clone()
                })
            })
            .collect()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.calls.front() {
            if now.duration_since(*front) >= self.config.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    fn maybe_warn_quota(&mut self) {
        let Some(limit) = self.config.session_quota else {
            return;
        };
        if self.quota_warned {
            return;
        }
        let pct = self.total_calls as f64 / limit as f64;
        if pct >= self.config.warn_threshold {
            self.quota_warned = true;
            warn!(
                used = self.total_calls,
                limit,
                pct = format!("{:.1}", pct * 100.0),
                "session quota threshold crossed"
            );
        }
    }
}
