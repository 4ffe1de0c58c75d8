//! Rate limiting: per-session token buckets and the process-wide login
//! throttle.
//!
//! Time is passed in explicitly as [`Instant`] values so every policy here
//! is testable without sleeping.
//!
//! # Memory Management
//!
//! The login throttle tracks source addresses in a map that attackers can
//! grow by spoofing, so it carries two defenses: periodic cleanup of
//! expired entries, and a hard cap on tracked addresses. When the cap is
//! reached and cleanup cannot reclaim space, new addresses are refused
//! outright — fail closed, never out of memory.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A classical token bucket: capacity and refill rate.
///
/// Token arithmetic is done in `f64` so sub-second refill fractions are not
/// lost between polls.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(capacity: u64, refill_per_sec: u64, now: Instant) -> Self {
        #[allow(clippy::cast_precision_loss)] // capacities are small integers
        let capacity = capacity as f64;
        #[allow(clippy::cast_precision_loss)]
        let refill_per_sec = refill_per_sec as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        self.last_refill = now;
    }

    /// Takes `amount` tokens if available.
    pub fn try_take(&mut self, amount: u64, now: Instant) -> bool {
        self.refill(now);
        #[allow(clippy::cast_precision_loss)]
        let amount = amount as f64;
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// How long until `amount` tokens will be available. Zero means they
    /// are available right now (nothing is debited). Requests above the
    /// bucket capacity are clamped to it, so they eventually succeed rather
    /// than waiting forever.
    pub fn delay_for(&mut self, amount: u64, now: Instant) -> Duration {
        self.refill(now);
        #[allow(clippy::cast_precision_loss)]
        let amount = (amount as f64).min(self.capacity);
        if self.tokens >= amount {
            return Duration::ZERO;
        }
        let deficit = amount - self.tokens;
        Duration::from_secs_f64(deficit / self.refill_per_sec)
    }
}

/// Per-session rate budgets.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Messages per second refill rate.
    pub messages_per_second: u64,
    /// Message bucket capacity.
    pub burst_size: u64,
    /// Bytes per second refill rate; bucket capacity is twice this.
    pub bandwidth_limit: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            messages_per_second: 100,
            burst_size: 200,
            bandwidth_limit: 1024 * 1024,
        }
    }
}

/// Verdict for an inbound frame against the session budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundVerdict {
    /// Within budget; the frame was debited.
    Allowed,
    /// Over budget, absorbed by the session's single grace event.
    Grace,
    /// Over budget with the grace already spent. Fatal.
    Exceeded,
}

/// Message and byte buckets for one session.
///
/// The grace allowance is per session, not per bucket: the first frame that
/// overruns either budget is forgiven, the second is fatal.
#[derive(Debug)]
pub struct SessionLimiter {
    msg_bucket: TokenBucket,
    byte_bucket: TokenBucket,
    grace_spent: bool,
}

impl SessionLimiter {
    /// Creates buckets sized per the configured limits.
    #[must_use]
    pub fn new(limits: SessionLimits, now: Instant) -> Self {
        Self {
            msg_bucket: TokenBucket::new(limits.burst_size, limits.messages_per_second, now),
            byte_bucket: TokenBucket::new(
                limits.bandwidth_limit.saturating_mul(2),
                limits.bandwidth_limit,
                now,
            ),
            grace_spent: false,
        }
    }

    /// Charges an inbound frame of `bytes` against both budgets.
    pub fn admit_inbound(&mut self, bytes: u64, now: Instant) -> InboundVerdict {
        let msg_ok = self.msg_bucket.try_take(1, now);
        let bytes_ok = self.byte_bucket.try_take(bytes, now);
        if msg_ok && bytes_ok {
            return InboundVerdict::Allowed;
        }
        if self.grace_spent {
            InboundVerdict::Exceeded
        } else {
            self.grace_spent = true;
            InboundVerdict::Grace
        }
    }

    /// Charges an outbound frame, or reports how long the write pump must
    /// park before the budgets can cover it.
    ///
    /// Returns `None` once the frame has been debited.
    pub fn admit_outbound(&mut self, bytes: u64, now: Instant) -> Option<Duration> {
        let msg_delay = self.msg_bucket.delay_for(1, now);
        let byte_delay = self.byte_bucket.delay_for(bytes, now);
        let delay = msg_delay.max(byte_delay);
        if delay > Duration::ZERO {
            return Some(delay);
        }
        // Both buckets can pay; debit them.
        let msg_paid = self.msg_bucket.try_take(1, now);
        let bytes_paid = self.byte_bucket.try_take(bytes, now);
        debug_assert!(msg_paid && bytes_paid);
        None
    }
}

/// Configuration for the login throttle.
#[derive(Debug, Clone)]
pub struct LoginThrottleConfig {
    /// Attempts allowed per window.
    pub max_attempts: u32,
    /// Sliding window length.
    pub window: Duration,
    /// Lockout applied once the window is exhausted.
    pub lockout: Duration,
    /// Hard cap on tracked source addresses.
    pub max_tracked_addrs: usize,
    /// Run cleanup every N checks.
    pub cleanup_interval: u64,
}

impl Default for LoginThrottleConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(15 * 60),
            lockout: Duration::from_secs(5 * 60),
            max_tracked_addrs: 10_000,
            cleanup_interval: 64,
        }
    }
}

/// Outcome of a login-throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginGate {
    /// Attempt may proceed (and has been recorded).
    Allowed,
    /// Source is locked out.
    LockedOut {
        /// Time remaining until the lockout lifts.
        retry_after: Duration,
    },
}

#[derive(Debug, Default)]
struct AttemptRecord {
    attempts: Vec<Instant>,
    locked_until: Option<Instant>,
}

/// Process-wide per-source-address limiter for authentication attempts.
///
/// Thread-safe: checks take a read lock first and only upgrade to a write
/// lock to record the attempt.
pub struct LoginThrottle {
    config: LoginThrottleConfig,
    state: RwLock<HashMap<IpAddr, AttemptRecord>>,
    check_count: AtomicU64,
}

impl LoginThrottle {
    /// Creates a throttle with the given configuration.
    #[must_use]
    pub fn new(config: LoginThrottleConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
            check_count: AtomicU64::new(0),
        }
    }

    /// Checks whether `addr` may attempt a login at `now`, recording the
    /// attempt if so. Exhausting the window starts the lockout.
    pub fn check(&self, addr: IpAddr, now: Instant) -> LoginGate {
        let count = self.check_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval == 0 {
            self.cleanup(now);
        }

        let cutoff = now.checked_sub(self.config.window).unwrap_or(now);

        {
            let state = self
                .state
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(record) = state.get(&addr) {
                if let Some(until) = record.locked_until {
                    if until > now {
                        return LoginGate::LockedOut {
                            retry_after: until - now,
                        };
                    }
                }
            } else if state.len() >= self.config.max_tracked_addrs {
                drop(state);
                self.cleanup(now);
                let state = self
                    .state
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if !state.contains_key(&addr) && state.len() >= self.config.max_tracked_addrs {
                    tracing::warn!(
                        addr = %addr,
                        tracked = state.len(),
                        "login throttle address table full, refusing new source"
                    );
                    return LoginGate::LockedOut {
                        retry_after: self.config.lockout,
                    };
                }
            }
        }

        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if !state.contains_key(&addr) && state.len() >= self.config.max_tracked_addrs {
            return LoginGate::LockedOut {
                retry_after: self.config.lockout,
            };
        }

        let record = state.entry(addr).or_default();

        // A lockout that expired since the read check is cleared here.
        if let Some(until) = record.locked_until {
            if until > now {
                return LoginGate::LockedOut {
                    retry_after: until - now,
                };
            }
            record.locked_until = None;
            record.attempts.clear();
        }

        record.attempts.retain(|&t| t > cutoff);
        if record.attempts.len() >= self.config.max_attempts as usize {
            let until = now + self.config.lockout;
            record.locked_until = Some(until);
            tracing::warn!(addr = %addr, "login attempts exhausted, locking out");
            return LoginGate::LockedOut {
                retry_after: self.config.lockout,
            };
        }

        record.attempts.push(now);
        LoginGate::Allowed
    }

    /// Drops entries with no live attempts and no active lockout.
    pub fn cleanup(&self, now: Instant) {
        let cutoff = now.checked_sub(self.config.window).unwrap_or(now);
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.retain(|_, record| {
            record.attempts.retain(|&t| t > cutoff);
            let locked = record.locked_until.is_some_and(|until| until > now);
            locked || !record.attempts.is_empty()
        });
    }

    /// Number of tracked source addresses.
    #[must_use]
    pub fn tracked_addrs(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
